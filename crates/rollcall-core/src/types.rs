use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of an enrolled person.
pub type PersonId = i64;

/// Face embedding vector produced by a descriptor extractor.
///
/// All embeddings held by one store share the same dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian f32 packing used for BLOB storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` when the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// An enrolled person as returned by registration and broadcast to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonSummary {
    pub id: PersonId,
    pub roll_number: String,
    pub name: String,
    pub department: String,
    /// Number of embeddings enrolled for this person.
    pub embeddings: usize,
    pub created_at: DateTime<Utc>,
}

/// One row of the person listing. Dashboards read the roll number as `rollNo`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentListing {
    pub id: PersonId,
    pub name: String,
    #[serde(rename = "rollNo")]
    pub roll_no: String,
    pub department: String,
    pub embeddings: usize,
}

impl From<PersonSummary> for StudentListing {
    fn from(person: PersonSummary) -> Self {
        Self {
            id: person.id,
            name: person.name,
            roll_no: person.roll_number,
            department: person.department,
            embeddings: person.embeddings,
        }
    }
}

/// One enrolled embedding with the identity fields needed to report a match.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub person_id: PersonId,
    pub roll_number: String,
    pub name: String,
    pub embedding: Embedding,
}

/// A ledger entry joined with the identity of the person it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: i64,
    pub person_id: PersonId,
    pub student_name: String,
    pub roll_number: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of one recognition task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    /// The frame could not be decoded or contained no face.
    NoFace,
    /// A face was found but no enrollment was close enough.
    Unknown {
        /// Distance to the nearest enrollment, if the gallery was non-empty.
        #[serde(skip_serializing_if = "Option::is_none")]
        distance: Option<f32>,
    },
    Matched {
        #[serde(rename = "personId")]
        person_id: PersonId,
        name: String,
        #[serde(rename = "rollNumber")]
        roll_number: String,
        distance: f32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.5, -0.25, 1.0]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_blob_packing() {
        let a = Embedding::new(vec![1.5, -2.0, 0.125]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Embedding::from_le_bytes(&bytes), Some(a));
        assert_eq!(Embedding::from_le_bytes(&bytes[..7]), None);
    }

    #[test]
    fn test_outcome_wire_format() {
        let matched = RecognitionOutcome::Matched {
            person_id: 7,
            name: "Ada".into(),
            roll_number: "CS-01".into(),
            distance: 0.0,
        };
        let json = serde_json::to_value(&matched).unwrap();
        assert_eq!(json["status"], "matched");
        assert_eq!(json["personId"], 7);
        assert_eq!(json["rollNumber"], "CS-01");

        let unknown = serde_json::to_value(RecognitionOutcome::Unknown { distance: None }).unwrap();
        assert_eq!(unknown, serde_json::json!({ "status": "unknown" }));

        let no_face = serde_json::to_value(RecognitionOutcome::NoFace).unwrap();
        assert_eq!(no_face, serde_json::json!({ "status": "no_face" }));
    }

    #[test]
    fn test_listing_field_names() {
        let person = PersonSummary {
            id: 3,
            roll_number: "EE-07".into(),
            name: "Grace".into(),
            department: "EE".into(),
            embeddings: 2,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(StudentListing::from(person)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 3,
                "name": "Grace",
                "rollNo": "EE-07",
                "department": "EE",
                "embeddings": 2,
            })
        );
    }
}

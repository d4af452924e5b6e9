use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Base URL of the rollcalld daemon
    #[arg(
        long,
        global = true,
        env = "ROLLCALL_SERVER",
        default_value = "http://127.0.0.1:8000"
    )]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a frame for recognition
    Recognize {
        /// Image file to submit
        image: PathBuf,
        /// Poll until the task settles
        #[arg(short, long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show the state of a recognition task
    Task {
        /// Task handle returned by `recognize`
        id: String,
    },
    /// Register a student from a face image
    Register {
        #[arg(long)]
        roll_number: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        department: String,
        /// Image file containing the student's face
        image: PathBuf,
    },
    /// List registered students
    Students,
    /// Show recent attendance events
    Attendance {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark attendance for a student by id
    Mark { person_id: i64 },
    /// Bulk-delete records
    Reset {
        #[arg(value_enum)]
        scope: Scope,
    },
    /// Show daemon status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    /// Students and their attendance
    Students,
    /// Attendance only
    Attendance,
    /// Everything
    All,
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await.context("daemon unreachable")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.http.get(format!("{}{path}", self.base))).await
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.post(format!("{}{path}", self.base))
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.http.delete(format!("{}{path}", self.base))).await
    }
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn wait_for(client: &Client, task_id: &str, timeout: Duration) -> Result<Value> {
    let started = Instant::now();
    loop {
        let state = client.get(&format!("/tasks/{task_id}")).await?;
        if state["status"] != "processing" {
            return Ok(state);
        }
        if started.elapsed() >= timeout {
            bail!("task {task_id} still processing after {}s", timeout.as_secs());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server)?;
    tracing::debug!(server = %client.base, "using daemon");

    match cli.command {
        Commands::Recognize {
            image,
            wait,
            timeout,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let request = client
                .post("/recognize")
                .header("content-type", "application/octet-stream")
                .body(bytes);
            let submitted = client.send(request).await?;
            let task_id = submitted["task_id"]
                .as_str()
                .context("daemon did not return a task id")?
                .to_string();
            if wait {
                let result = wait_for(&client, &task_id, Duration::from_secs(timeout)).await?;
                print(&result)?;
            } else {
                println!("{task_id}");
            }
        }
        Commands::Task { id } => {
            print(&client.get(&format!("/tasks/{id}")).await?)?;
        }
        Commands::Register {
            roll_number,
            name,
            department,
            image,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let request = client.post("/students").json(&json!({
                "rollNumber": roll_number,
                "name": name,
                "department": department,
                "image": general_purpose::STANDARD.encode(bytes),
            }));
            print(&client.send(request).await?)?;
        }
        Commands::Students => {
            let body = client.get("/students").await?;
            let students = body["students"].as_array().cloned().unwrap_or_default();
            if students.is_empty() {
                println!("No students registered");
            }
            for s in students {
                println!(
                    "{:>6}  {:<12} {:<24} {}",
                    s["id"].as_i64().unwrap_or_default(),
                    s["rollNo"].as_str().unwrap_or(""),
                    s["name"].as_str().unwrap_or(""),
                    s["department"].as_str().unwrap_or("")
                );
            }
        }
        Commands::Attendance { limit } => {
            let body = client.get(&format!("/attendance?limit={limit}")).await?;
            for r in body["attendance"].as_array().cloned().unwrap_or_default() {
                println!(
                    "{}  {:<12} {}",
                    r["timestamp"].as_str().unwrap_or(""),
                    r["rollNumber"].as_str().unwrap_or(""),
                    r["studentName"].as_str().unwrap_or("")
                );
            }
        }
        Commands::Mark { person_id } => {
            let request = client.post(&format!("/attendance/{person_id}"));
            print(&client.send(request).await?)?;
        }
        Commands::Reset { scope } => {
            let body = match scope {
                Scope::Students => client.delete("/admin/students").await?,
                Scope::Attendance => client.delete("/admin/attendance").await?,
                Scope::All => client.send(client.post("/admin/reset")).await?,
            };
            print(&body)?;
        }
        Commands::Status => match client.get("/").await {
            Ok(status) => print(&status)?,
            Err(err) => println!("rollcalld: not connected ({err})"),
        },
    }

    Ok(())
}

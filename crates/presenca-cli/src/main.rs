use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "presenca", about = "Presenca attendance CLI")]
struct Cli {
    /// Base URL of presencad
    #[arg(long, env = "PRESENCA_URL", default_value = "http://127.0.0.1:5000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Profile {
    /// Full name
    #[arg(long)]
    name: String,
    /// Class, e.g. "5A"
    #[arg(long = "class")]
    class_name: String,
    /// Shift, e.g. "morning"
    #[arg(long)]
    shift: String,
    #[arg(long)]
    age: u32,
    /// School unit id
    #[arg(long)]
    unit: Option<i64>,
}

impl Profile {
    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "class_name": self.class_name,
            "shift": self.shift,
            "age": self.age,
            "school_unit_id": self.unit,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Register a student with a reference photo
    Enroll {
        /// Student id (matricula)
        id: String,
        #[command(flatten)]
        profile: Profile,
        /// Reference photo
        #[arg(long)]
        photo: PathBuf,
    },
    /// List registered students
    List {
        #[arg(long)]
        unit: Option<i64>,
    },
    /// Show one student
    Show { id: String },
    /// Edit a student's profile
    Update {
        id: String,
        #[command(flatten)]
        profile: Profile,
    },
    /// Replace a student's reference photo
    Photo { id: String, photo: PathBuf },
    /// Recompute a student's embedding from the stored photo
    Reembed { id: String },
    /// Remove a student
    Remove { id: String },
    /// Check in from a captured image
    Recognize { image: PathBuf },
    /// Attendance report
    Attendances {
        /// First day, YYYY-MM-DD (UTC)
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD (UTC)
        #[arg(long)]
        to: Option<String>,
        #[arg(long = "class")]
        class_name: Option<String>,
        /// Substring of student id or name
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        unit: Option<i64>,
    },
    /// Manage school units
    Units {
        #[command(subcommand)]
        command: UnitCommands,
    },
}

#[derive(Subcommand)]
enum UnitCommands {
    List,
    Add {
        name: String,
        #[arg(long)]
        ip_start: Option<String>,
        #[arg(long)]
        ip_end: Option<String>,
    },
    Update {
        id: i64,
        name: String,
        #[arg(long)]
        ip_start: Option<String>,
        #[arg(long)]
        ip_end: Option<String>,
    },
    Remove { id: i64 },
}

struct Api {
    client: Client,
    base: String,
}

impl Api {
    fn new(base: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build().context("building HTTP client")?,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{path}", self.base))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach presencad at {}", self.base))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        tracing::debug!(%status, "response");
        if status.is_client_error() || status.is_server_error() {
            let message = body.get("error").and_then(Value::as_str).unwrap_or("no details");
            bail!("presencad returned {status}: {message}");
        }
        Ok(body)
    }
}

fn encode_photo(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_enroll(value: &Value) -> Result<()> {
    if value["status"] == "registered_not_recognizable" {
        eprintln!("warning: student saved but not recognizable; retry with `presenca photo` or `presenca reembed`");
    }
    print(value)
}

fn unit_body(name: String, ip_start: Option<String>, ip_end: Option<String>) -> Value {
    json!({ "name": name, "ip_range_start": ip_start, "ip_range_end": ip_end })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let api = Api::new(&cli.url)?;

    match cli.command {
        Commands::Status => {
            let status = api.send(api.request(Method::GET, "/api/status")).await?;
            print(&status)?;
        }
        Commands::Enroll { id, profile, photo } => {
            let mut body = profile.to_json();
            body["student_id"] = json!(id);
            body["image"] = json!(encode_photo(&photo)?);
            let result = api.send(api.request(Method::POST, "/api/students").json(&body)).await?;
            print_enroll(&result)?;
        }
        Commands::List { unit } => {
            let mut request = api.request(Method::GET, "/api/students");
            if let Some(unit) = unit {
                request = request.query(&[("school_unit_id", unit)]);
            }
            let students = api.send(request).await?;
            let rows = students.as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                println!("No students registered");
            }
            for s in rows {
                let flag = if s["recognizable"] == true { "" } else { "  (not recognizable)" };
                println!(
                    "{:<12} {:<30} {:<6} {}{flag}",
                    s["student_id"].as_str().unwrap_or("?"),
                    s["name"].as_str().unwrap_or("?"),
                    s["class_name"].as_str().unwrap_or(""),
                    s["shift"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Show { id } => {
            let student = api.send(api.request(Method::GET, &format!("/api/students/{id}"))).await?;
            print(&student)?;
        }
        Commands::Update { id, profile } => {
            let result = api
                .send(api.request(Method::PUT, &format!("/api/students/{id}")).json(&profile.to_json()))
                .await?;
            print(&result)?;
        }
        Commands::Photo { id, photo } => {
            let body = json!({ "image": encode_photo(&photo)? });
            let result = api
                .send(api.request(Method::PUT, &format!("/api/students/{id}/photo")).json(&body))
                .await?;
            print_enroll(&result)?;
        }
        Commands::Reembed { id } => {
            let result = api
                .send(api.request(Method::POST, &format!("/api/students/{id}/reembed")))
                .await?;
            print_enroll(&result)?;
        }
        Commands::Remove { id } => {
            let result = api.send(api.request(Method::DELETE, &format!("/api/students/{id}"))).await?;
            print(&result)?;
        }
        Commands::Recognize { image } => {
            let body = json!({ "image": encode_photo(&image)? });
            let result = api.send(api.request(Method::POST, "/api/recognize").json(&body)).await?;
            println!("{}", result["message"].as_str().unwrap_or("no message"));
            if result["recognized"] == true {
                println!(
                    "student {} (distance {:.3})",
                    result["student_id"].as_str().unwrap_or("?"),
                    result["distance"].as_f64().unwrap_or(f64::NAN)
                );
            }
        }
        Commands::Attendances {
            from,
            to,
            class_name,
            search,
            unit,
        } => {
            let mut query: Vec<(&str, String)> = Vec::new();
            let pairs = [
                ("start_date", from),
                ("end_date", to),
                ("class_name", class_name),
                ("search", search),
                ("school_unit_id", unit.map(|u| u.to_string())),
            ];
            for (key, value) in pairs {
                if let Some(value) = value {
                    query.push((key, value));
                }
            }
            let rows = api
                .send(api.request(Method::GET, "/api/attendances").query(&query))
                .await?;
            for r in rows.as_array().cloned().unwrap_or_default() {
                println!(
                    "{}  {:<12} {:<30} {:<6} {}",
                    r["timestamp"].as_str().unwrap_or("?"),
                    r["student_id"].as_str().unwrap_or("?"),
                    r["name"].as_str().unwrap_or("(deleted)"),
                    r["class_name"].as_str().unwrap_or(""),
                    r["client_ip"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Units { command } => match command {
            UnitCommands::List => {
                let units = api.send(api.request(Method::GET, "/api/school_units")).await?;
                for u in units.as_array().cloned().unwrap_or_default() {
                    println!(
                        "{:<4} {:<30} {} - {}",
                        u["id"],
                        u["name"].as_str().unwrap_or("?"),
                        u["ip_range_start"].as_str().unwrap_or("*"),
                        u["ip_range_end"].as_str().unwrap_or("*"),
                    );
                }
            }
            UnitCommands::Add { name, ip_start, ip_end } => {
                let body = unit_body(name, ip_start, ip_end);
                let result = api.send(api.request(Method::POST, "/api/school_units").json(&body)).await?;
                print(&result)?;
            }
            UnitCommands::Update {
                id,
                name,
                ip_start,
                ip_end,
            } => {
                let body = unit_body(name, ip_start, ip_end);
                let result = api
                    .send(api.request(Method::PUT, &format!("/api/school_units/{id}")).json(&body))
                    .await?;
                print(&result)?;
            }
            UnitCommands::Remove { id } => {
                let result = api
                    .send(api.request(Method::DELETE, &format!("/api/school_units/{id}")))
                    .await?;
                print(&result)?;
            }
        },
    }

    Ok(())
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use experiment_scheduler::auth::UserStore;
use experiment_scheduler::{
    Command, CommandValue, CompileContext, CompileError, CompiledStep, DataMap, DatabaseConfig,
    DeviceConfig, Experiment, SchedulerConfig, Signal, Sweep, SweepPoint, SweepSource,
    TaskDefinition, create_connection, create_simulated_scheduler, ensure_schema,
};

#[derive(Parser)]
#[command(name = "experiment-scheduler")]
#[command(about = "Experiment program scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init {
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
    /// Create a user able to own tasks
    AddUser {
        name: String,
        #[arg(long, env = "SCHED_USER_PASSWORD")]
        password: String,
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
    /// Run a frequency sweep against the simulated executor
    Demo {
        /// Device configuration (JSON); a small built-in one is used if omitted
        #[arg(long)]
        device: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        points: usize,
        #[arg(long, default_value_t = 5.0e9)]
        start: f64,
        #[arg(long, default_value_t = 1.0e6)]
        step: f64,
    },
}

/// Spectroscopy-like sweep: set the drive frequency, read one channel.
struct FrequencySweep {
    frequencies: Vec<f64>,
}

#[async_trait]
impl Experiment for FrequencySweep {
    fn sweep(&self) -> Box<dyn SweepSource> {
        Box::new(Sweep::new().axis("frequency", self.frequencies.clone()))
    }

    async fn compile_step(
        &self,
        point: &SweepPoint,
        ctx: &CompileContext,
    ) -> Result<CompiledStep, CompileError> {
        let frequency = point.get_f64("frequency").unwrap_or_default();
        let channel = ctx.config().require_str("Q1.channel.drive")?;
        let shots = ctx.config().require_f64("Q1.setting.shots")?;
        Ok(CompiledStep::new(
            vec![
                Command::write(format!("{channel}.Frequency"), CommandValue::setting(frequency)),
                Command::trig("Trigger.CH1"),
                Command::read("AD1.CH1.IQ"),
            ],
            DataMap::new(Signal::Iq, shots as u32).slot("Q1", "AD1.CH1.IQ"),
        ))
    }
}

fn demo_device() -> Value {
    json!({
        "Q1": {
            "channel": {"drive": "PSG1.CH1"},
            "setting": {"shots": 1024},
        },
        "PSG1": {"CH1": {"Frequency": 6.0e9}},
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("experiment_scheduler=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url } => {
            let db_config = DatabaseConfig {
                url: db_url,
                ..Default::default()
            };
            info!("Initializing database at {}", db_config.url);
            let db = create_connection(db_config).await?;
            ensure_schema(&db).await?;
            println!("Database initialized");
        }
        Commands::AddUser {
            name,
            password,
            db_url,
        } => {
            let db_config = DatabaseConfig {
                url: db_url,
                ..Default::default()
            };
            let db = create_connection(db_config).await?;
            ensure_schema(&db).await?;
            let user = UserStore::new(db).create_user(&name, &password).await?;
            println!("Created user {} ({})", user.name, user.id);
        }
        Commands::Demo {
            device,
            points,
            start,
            step,
        } => {
            let device = match device {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => demo_device(),
            };

            let mut config = SchedulerConfig::load()?;
            config.poll_interval = Duration::from_millis(20);
            config.database = DatabaseConfig::memory();

            let (scheduler, _executor) =
                create_simulated_scheduler(DeviceConfig::new(device), config).await?;

            let frequencies = (0..points).map(|i| start + step * i as f64).collect();
            let task = scheduler.create_task(TaskDefinition::new(
                "spectroscopy",
                Arc::new(FrequencySweep { frequencies }),
            ));
            let id = scheduler.submit(&task).await?;
            let status = task.join().await;

            println!("Task {} ({}) {}", task.name(), id, status);
            if let Some(failure) = task.failure() {
                println!("  Failure: {}", failure);
            }
            for result in scheduler.fetch(&task, 0).await? {
                println!("  Step {}: {}", result.step, result.data);
            }
            scheduler.shutdown().await;
        }
    }

    Ok(())
}

// External crates
use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;

// Local modules
use rbc_heatflux_gru::config::ForecastConfig;
use rbc_heatflux_gru::error::ForecastError;
use rbc_heatflux_gru::{built_info, pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Operation {
    Train,
    Predict,
}

#[derive(Parser, Debug)]
#[command(name = "rbc-heatflux-gru")]
#[command(version, about = "GRU forecaster for local turbulent heat flux in Rayleigh-Bénard convection", long_about = None)]
struct Cli {
    /// Operation that shall be performed
    #[arg(short, long, value_enum)]
    operation: Operation,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    input_len: Option<usize>,

    #[arg(long)]
    target_len: Option<usize>,

    #[arg(long)]
    stride: Option<usize>,

    #[arg(long)]
    hidden_size: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Steps to forecast in predict mode
    #[arg(long)]
    horizon: Option<usize>,

    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Directory receiving predicted vs. ground-truth CSV files
    #[arg(long)]
    export_path: Option<PathBuf>,

    /// Overwrite an existing checkpoint
    #[arg(long)]
    force: bool,

    /// Continue training from an existing checkpoint
    #[arg(long)]
    resume: bool,
}

impl Cli {
    fn forecast_config(&self) -> Result<ForecastConfig> {
        let mut config = match &self.config {
            Some(path) => ForecastConfig::from_json_file(path)?,
            None => ForecastConfig::default(),
        };

        if let Some(v) = self.input_len {
            config.window.input_len = v;
        }
        if let Some(v) = self.target_len {
            config.window.target_len = v;
        }
        if let Some(v) = self.stride {
            config.window.stride = v;
        }
        if let Some(v) = self.hidden_size {
            config.hidden_size = v;
        }
        if let Some(v) = self.epochs {
            config.training.epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.training.batch_size = v;
        }
        if let Some(v) = self.learning_rate {
            config.training.learning_rate = v;
        }
        if let Some(v) = self.horizon {
            config.horizon = v;
        }
        if let Some(v) = &self.checkpoint_path {
            config.checkpoint_dir = v.clone();
        }
        if let Some(v) = &self.data_path {
            config.data_path = v.clone();
        }
        if let Some(v) = &self.export_path {
            config.export_path = Some(v.clone());
        }
        config.force |= self.force;
        config.resume |= self.resume;
        Ok(config)
    }
}

/// Name of the first [`ForecastError`] in the chain, for the error line
fn error_kind(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|e| e.downcast_ref::<ForecastError>())
        .map_or("Error", ForecastError::kind)
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.forecast_config()?;
    info!(
        "{} v{} ({:?})",
        built_info::PKG_NAME,
        built_info::PKG_VERSION,
        cli.operation
    );

    match cli.operation {
        Operation::Train => {
            let outcome = pipeline::train(&config)?;
            let report = &outcome.report;
            println!(
                "Training finished: {:?} after {} epochs ({} steps)",
                report.final_state, report.epochs_run, report.steps
            );
            println!("Initial loss: {:.6}", report.initial_loss);
            if let Some(loss) = report.final_train_loss() {
                println!("Final training loss: {:.6}", loss);
            }
            if let (Some(loss), Some(epoch)) = (report.best_val_loss, report.best_epoch) {
                println!("Best monitored loss: {:.6} (epoch {})", loss, epoch);
            }
        }
        Operation::Predict => {
            let comparisons = pipeline::predict(&config)?;
            for comparison in &comparisons {
                let trajectory = &comparison.trajectory;
                match comparison.rmse() {
                    Some(rmse) => {
                        let per_feature: Vec<String> = trajectory
                            .feature_names
                            .iter()
                            .zip(rmse)
                            .map(|(name, value)| format!("{}={:.6}", name, value))
                            .collect();
                        println!(
                            "Forecast from step {} ({} steps): RMSE {}",
                            trajectory.start,
                            trajectory.horizon(),
                            per_feature.join(", ")
                        );
                    }
                    None => println!(
                        "Forecast from step {} ({} steps): no ground truth",
                        trajectory.start,
                        trajectory.horizon()
                    ),
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", error_kind(&e), e);
            ExitCode::FAILURE
        }
    }
}

//! CLI entry point for intrinsic map generation

use anyhow::Result;
use clap::{Parser, Subcommand};
use intrinsic_lora::pipeline::{IntrinsicLoraGenerator, DEFAULT_WEIGHTS_DIR};
use intrinsic_lora::tasks::Task;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "intrinsic-lora")]
#[command(version)]
#[command(about = "Generate intrinsic image maps with a LoRA-specialized diffusion model", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate intrinsic maps from a rendered photograph
    ///
    /// Runs one single-step inference pass per requested task, swapping the
    /// task's adaptation weights in between, and writes
    /// `<input stem>_<task>.png` next to each other in the output
    /// directory.
    Generate {
        /// Path to a single-file Stable Diffusion 1.5 checkpoint
        #[arg(short, long)]
        model: PathBuf,

        /// Model config JSON; supplying one selects offline operation
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Input photograph (the rendered viewport)
        #[arg(short, long)]
        input: PathBuf,

        /// Directory receiving the generated maps
        #[arg(short, long, default_value = "renders")]
        output_dir: PathBuf,

        /// Tasks to run, in any order; defaults to all four
        #[arg(short, long, value_delimiter = ',')]
        task: Vec<String>,

        /// Directory holding the per-task adaptation weight files
        #[arg(long, default_value = DEFAULT_WEIGHTS_DIR)]
        weights_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            config,
            input,
            output_dir,
            task,
            weights_dir,
        } => {
            // Resolve task names before any model work; an unknown name is
            // a usage error, not something to fall back from.
            let tasks: Vec<Task> = if task.is_empty() {
                Task::ALL.to_vec()
            } else {
                task.iter()
                    .map(|name| name.parse())
                    .collect::<Result<_>>()?
            };

            std::fs::create_dir_all(&output_dir)?;

            let mut generator =
                IntrinsicLoraGenerator::new(&model, config.as_deref())?.with_weights_dir(weights_dir);

            for task in Task::ALL {
                if !tasks.contains(&task) {
                    continue;
                }
                let image = generator.generate_image(&input, Some(&output_dir), task)?;
                println!(
                    "{}: {}x{} map written to {}",
                    task,
                    image.width(),
                    image.height(),
                    output_dir.display()
                );
            }

            generator.close()?;
        }
    }

    Ok(())
}

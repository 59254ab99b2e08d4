use clap::{Parser, Subcommand};
use cloud_mirror::{devops, run};

#[derive(Parser)]
#[command(name = "cloud-mirror", about = "Cloud Mirror - regional read-through caching redirect proxy")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the local S3/SQS/DynamoDB emulator stack (docker compose up -d localstack)
	StartLocalStack {
		/// Build the image before bringing up the service
		#[arg(long)]
		build: bool,
		/// Force recreate containers
		#[arg(long)]
		force_recreate: bool,
		/// Timeout in seconds for docker commands
		#[arg(long, default_value_t = 120)]
		timeout: u64,
		/// Number of retry attempts on failure
		#[arg(long, default_value_t = 2u8)]
		retries: u8,
		/// Optional working directory where docker-compose.yml lives
		#[arg(long)]
		workdir: Option<String>,
	},
	/// Stop the local emulator stack (docker compose stop localstack)
	StopLocalStack,
	/// Run the redirect service and fleet of copy workers (default)
	Run,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Run) {
		Commands::StartLocalStack {
			build,
			force_recreate,
			timeout,
			retries,
			workdir,
		} => {
			let opts = devops::localstack::StartOptions {
				build,
				force_recreate,
				timeout_secs: timeout,
				retries,
				workdir: workdir.map(std::path::PathBuf::from),
			};

			match devops::localstack::start_localstack_with_opts(opts).await {
				Ok(true) => println!("LocalStack started (cloud-mirror will stop it)."),
				Ok(false) => println!("LocalStack already running; not started."),
				Err(e) => {
					eprintln!("Failed to start LocalStack: {}", e);
					std::process::exit(1);
				}
			}
		}
		Commands::StopLocalStack => match devops::stop_localstack().await {
			Ok(()) => println!("LocalStack stopped."),
			Err(e) => {
				eprintln!("Failed to stop LocalStack: {}", e);
				std::process::exit(1);
			}
		},
		Commands::Run => {
			run().await;
		}
	}
}

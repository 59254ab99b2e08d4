use anyhow::{Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::{error, info};

/// Options to control compose start behavior for the local S3/SQS/DynamoDB
/// emulator stack (LocalStack) used during development.
#[derive(Debug, Clone)]
pub struct StartOptions {
	pub build: bool,
	pub force_recreate: bool,
	pub timeout_secs: u64,
	pub retries: u8,
	pub workdir: Option<PathBuf>,
}

impl Default for StartOptions {
	fn default() -> Self {
		Self {
			build: false,
			force_recreate: false,
			timeout_secs: 120,
			retries: 2,
			workdir: None,
		}
	}
}

const SERVICE: &str = "localstack";

/// Detects whether `docker compose` (v2) is available, otherwise falls
/// back to `docker-compose` (v1).
async fn detect_compose() -> Option<(String, bool)> {
	if let Ok(mut cmd) = Command::new("docker").arg("compose").arg("version").spawn() {
		if let Ok(status) = cmd.wait().await {
			if status.success() {
				return Some(("docker".to_string(), true));
			}
		}
	}

	if let Ok(mut cmd) = Command::new("docker-compose").arg("--version").spawn() {
		if let Ok(status) = cmd.wait().await {
			if status.success() {
				return Some(("docker-compose".to_string(), false));
			}
		}
	}

	None
}

async fn run_command_with_timeout(mut cmd: Command, timeout_secs: u64) -> Result<()> {
	let dur = Duration::from_secs(timeout_secs);
	info!(?cmd, "running command with timeout");
	let f = cmd.status();
	match timeout(dur, f).await {
		Ok(Ok(status)) => {
			if status.success() {
				Ok(())
			} else {
				Err(anyhow!("command exited with non-zero status"))
			}
		}
		Ok(Err(e)) => Err(anyhow!("failed to spawn command: {}", e)),
		Err(_) => Err(anyhow!("command timed out after {}s", timeout_secs)),
	}
}

async fn run_command_capture(mut cmd: Command, timeout_secs: u64) -> Result<String> {
	let dur = Duration::from_secs(timeout_secs);
	let f = cmd.output();
	match timeout(dur, f).await {
		Ok(Ok(output)) => {
			if output.status.success() {
				Ok(String::from_utf8_lossy(&output.stdout).to_string())
			} else {
				Err(anyhow!("command exited with non-zero status"))
			}
		}
		Ok(Err(e)) => Err(anyhow!("failed to spawn command: {}", e)),
		Err(_) => Err(anyhow!("command timed out after {}s", timeout_secs)),
	}
}

async fn get_container_id(
	prog: &str,
	is_docker_compose: bool,
	wd: &Option<PathBuf>,
) -> Result<Option<String>> {
	let mut cmd = if is_docker_compose {
		let mut c = Command::new(prog);
		c.arg("compose").arg("ps").arg("-q").arg(SERVICE);
		c
	} else {
		let mut c = Command::new(prog);
		c.arg("ps").arg("-q").arg(SERVICE);
		c
	};
	if let Some(d) = wd {
		cmd.current_dir(d);
	}

	match run_command_capture(cmd, 10).await {
		Ok(s) => {
			let id = s.trim();
			if id.is_empty() { Ok(None) } else { Ok(Some(id.to_string())) }
		}
		Err(_) => Ok(None),
	}
}

async fn inspect_running(container_id: &str) -> Result<bool> {
	let mut cmd = Command::new("docker");
	cmd.arg("inspect").arg("-f").arg("{{.State.Running}}").arg(container_id);
	let out = cmd
		.output()
		.await
		.map_err(|e| anyhow!("failed to inspect container: {}", e))?;
	if !out.status.success() {
		return Ok(false);
	}
	Ok(String::from_utf8_lossy(&out.stdout).trim() == "true")
}

fn marker_path(wd: &Option<PathBuf>) -> PathBuf {
	if let Some(d) = wd {
		d.join(".cloud_mirror_localstack_started")
	} else {
		env::current_dir()
			.unwrap_or_else(|_| PathBuf::from("."))
			.join(".cloud_mirror_localstack_started")
	}
}

fn write_marker(wd: &Option<PathBuf>, container_id: &str) -> Result<()> {
	std::fs::write(marker_path(wd), container_id)
		.map_err(|e| anyhow!("failed to write marker file: {}", e))
}

/// Starts the LocalStack service defined in `docker-compose.yml`. Returns
/// `Ok(true)` if this call started it, `Ok(false)` if it was already
/// running.
pub async fn start_localstack_with_opts(opts: StartOptions) -> Result<bool> {
	let (prog, is_docker_compose) = detect_compose()
		.await
		.ok_or_else(|| anyhow!("neither 'docker compose' nor 'docker-compose' found in PATH"))?;

	let wd = opts.workdir.or_else(|| env::current_dir().ok());

	if opts.build {
		let mut build_cmd = if is_docker_compose {
			let mut c = Command::new(&prog);
			c.arg("compose").arg("build").arg(SERVICE);
			c
		} else {
			let mut c = Command::new(&prog);
			c.arg("build").arg(SERVICE);
			c
		};
		if let Some(ref d) = wd {
			build_cmd.current_dir(d);
		}
		run_command_with_timeout(build_cmd, opts.timeout_secs).await?;
	}

	if let Ok(Some(id)) = get_container_id(&prog, is_docker_compose, &wd).await {
		if let Ok(true) = inspect_running(&id).await {
			info!(container_id = %id, "localstack already running");
			return Ok(false);
		}
	}

	let mut attempts = 0u8;
	let mut last_err = None;
	while attempts <= opts.retries {
		let mut up_cmd = if is_docker_compose {
			let mut c = Command::new(&prog);
			c.arg("compose").arg("up").arg("-d").arg(SERVICE);
			if opts.force_recreate {
				c.arg("--force-recreate");
			}
			c
		} else {
			let mut c = Command::new(&prog);
			c.arg("up").arg("-d").arg(SERVICE);
			if opts.force_recreate {
				c.arg("--force-recreate");
			}
			c
		};
		if let Some(ref d) = wd {
			up_cmd.current_dir(d);
		}

		match run_command_with_timeout(up_cmd, opts.timeout_secs).await {
			Ok(()) => {
				if let Ok(Some(id)) = get_container_id(&prog, is_docker_compose, &wd).await {
					if let Err(e) = write_marker(&wd, &id) {
						error!(error = %e, "failed to write marker file");
					}
				}
				return Ok(true);
			}
			Err(e) => {
				error!(attempt = attempts + 1, error = %e, "docker compose up failed");
				last_err = Some(e);
				attempts += 1;
				sleep(Duration::from_secs(2)).await;
			}
		}
	}

	Err(last_err.unwrap_or_else(|| anyhow!("docker compose up failed after retries")))
}

/// Stops the LocalStack service, but only if this tool started it
/// (determined by the presence of a marker file).
pub async fn stop_localstack() -> Result<()> {
	let (prog, is_docker_compose) = detect_compose()
		.await
		.ok_or_else(|| anyhow!("neither 'docker compose' nor 'docker-compose' found in PATH"))?;

	let wd = env::current_dir().ok();
	let marker = marker_path(&wd);
	if !marker.exists() {
		info!("marker file not found; will not stop a localstack this tool did not start");
		return Ok(());
	}

	let container_id = std::fs::read_to_string(&marker).ok().map(|s| s.trim().to_string());

	if let Some(ref id) = container_id {
		if let Ok(false) = inspect_running(id).await {
			let _ = std::fs::remove_file(&marker);
			info!(container_id = %id, "marker existed but container not running; removed marker");
			return Ok(());
		}
	}

	let mut cmd = if is_docker_compose {
		let mut c = Command::new(&prog);
		c.arg("compose").arg("stop").arg(SERVICE);
		c
	} else {
		let mut c = Command::new(&prog);
		c.arg("stop").arg(SERVICE);
		c
	};
	if let Some(ref d) = wd {
		cmd.current_dir(d);
	}

	match run_command_with_timeout(cmd, 60).await {
		Ok(()) => {
			let mut rm_cmd = if is_docker_compose {
				let mut c = Command::new(&prog);
				c.arg("compose").arg("rm").arg("-f").arg(SERVICE);
				c
			} else {
				let mut c = Command::new(&prog);
				c.arg("rm").arg("-f").arg(SERVICE);
				c
			};
			if let Some(ref d) = wd {
				rm_cmd.current_dir(d);
			}
			let _ = run_command_with_timeout(rm_cmd, 60).await;

			let _ = std::fs::remove_file(&marker);
			info!("localstack stopped and marker removed");
			Ok(())
		}
		Err(e) => Err(e),
	}
}

pub async fn start_localstack() -> Result<bool> {
	start_localstack_with_opts(StartOptions::default()).await
}

#[cfg(feature = "devops-tests")]
mod tests {
	use super::*;

	#[tokio::test]
	async fn detect_no_crash() {
		let _ = detect_compose().await;
	}
}

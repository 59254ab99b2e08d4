pub mod localstack;
pub mod rate_limiter;

pub use localstack::{start_localstack, stop_localstack};
pub use rate_limiter::SharedRateLimitLayer;

#[cfg(feature = "devops-tests")]
mod tests {
	use super::*;

	#[test]
	fn mod_compiles() {
		// smoke compile test
		let _ = 1 + 1;
	}
}

pub mod rate_limit;
pub mod run_log;
pub mod util;

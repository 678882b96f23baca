use log::LevelFilter;

/// Returns the log level the engine was built for.
///
/// The engine never installs a logger itself; the embedding driver owns the
/// [`log`] backend and is expected to apply this filter with
/// [`log::set_max_level`] (see [`init`]).
pub fn max_level() -> LevelFilter {
	// Determines LevelFilter at compile time
	let log_level: Option<&'static str> = sge_var!("SGE_LOG_LEVEL_FILTER");
	match log_level {
		Some("Error") => LevelFilter::Error,
		Some("Debug") => LevelFilter::Debug,
		Some("Off") => LevelFilter::Off,
		Some("Trace") => LevelFilter::Trace,
		Some("Warn") => LevelFilter::Warn,
		Some("Info") => LevelFilter::Info,
		_ => LevelFilter::Info,
	}
}

/// Applies [`max_level`] to the global logger.
pub fn init() {
	log::set_max_level(max_level());
}

macro_rules! infoheader {
	($str:expr) => {{
		info!("");
		info!("{:=^70}", $str);
	}};
}

macro_rules! infoentry {
	($str:expr, $rhs:expr) => (infoentry!($str, "{}", $rhs));
	($str:expr, $($arg:tt)+) => (info!("{:25}{}", concat!($str, ":"), format_args!($($arg)+)));
}

macro_rules! infofooter {
	() => {{
		info!("{:=^70}", '=');
		info!("");
	}};
}

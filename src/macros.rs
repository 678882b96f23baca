/// Fetches a build-time configuration variable.
///
/// Tunables are baked in when the engine is compiled; runtime overrides go
/// through [`SgeParams::parse`](crate::config::SgeParams::parse).
macro_rules! sge_var {
	($name:literal) => {{ option_env!($name) }};
}

/// Fetches according to [`sge_var`] and parses the value, or returns the
/// specified default value if the variable is unset or malformed.
macro_rules! sge_var_or {
	($name:literal, $default:expr) => {{ $crate::config::parse_or(sge_var!($name), $default) }};
}

/// Returns `Err(ParamError::Invalid)` from the enclosing function unless the
/// condition holds.
macro_rules! ensure_param {
	($cond:expr, $name:expr) => {
		if !$cond {
			return Err($crate::config::ParamError::Invalid($name));
		}
	};
}

/// Options fixed for the lifetime of a [`super::Cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
	/// Lightweight mode: property indices are not cached and prim indices
	/// can be computed in parallel.
	pub usd: bool,
	/// Drop graph nodes that provide no opinions, remembering them as
	/// culled dependencies.
	pub cull: bool,
	/// The file format target passed along with dynamic file format arguments.
	pub file_format_target: String,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			usd: false,
			cull: true,
			file_format_target: String::new(),
		}
	}
}

impl CacheConfig {
	/// Lightweight mode configuration.
	pub fn usd() -> Self {
		Self {
			usd: true,
			..Self::default()
		}
	}

	/// The default configuration adjusted by the environment.
	///
	/// `PCP_CULLING` set to `0`, `false` or `off` disables culling.
	pub fn from_env() -> Self {
		let mut config = Self::default();
		if let Ok(value) = std::env::var("PCP_CULLING") {
			config.cull = parse_switch(&value).unwrap_or(config.cull);
		}
		config
	}

	pub fn with_usd(mut self, usd: bool) -> Self {
		self.usd = usd;
		self
	}

	pub fn with_cull(mut self, cull: bool) -> Self {
		self.cull = cull;
		self
	}

	pub fn with_file_format_target(mut self, target: impl Into<String>) -> Self {
		self.file_format_target = target.into();
		self
	}
}

fn parse_switch(value: &str) -> Option<bool> {
	match value.trim().to_ascii_lowercase().as_str() {
		"0" | "false" | "off" | "no" => Some(false),
		"1" | "true" | "on" | "yes" => Some(true),
		_ => None,
	}
}

use std::sync::Arc;

/// Token for efficient comparison, assignment, and hashing of known strings.
///
/// Cloning a token shares the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
	data: Arc<str>,
}

impl Token {
	pub fn new(name: impl AsRef<str>) -> Self {
		Token {
			data: Arc::from(name.as_ref()),
		}
	}

	pub fn empty() -> Self {
		Token { data: Arc::from("") }
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn as_str(&self) -> &str {
		&self.data
	}
}

impl Default for Token {
	fn default() -> Self {
		Self::empty()
	}
}

impl From<&str> for Token {
	fn from(name: &str) -> Self {
		Self::new(name)
	}
}

impl std::borrow::Borrow<str> for Token {
	fn borrow(&self) -> &str {
		&self.data
	}
}

impl std::fmt::Display for Token {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str(&self.data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	#[test]
	fn lookup_by_str() {
		let names: HashSet<Token> = ["a", "b"].into_iter().map(Token::new).collect();
		assert!(names.contains("a"));
		assert!(!names.contains("c"));
		assert!(Token::default().is_empty());
	}
}

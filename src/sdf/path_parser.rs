use crate::{sdf, tf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid path {input:?} at offset {offset}: {msg}")]
pub struct ParseError {
	pub input: String,
	pub offset: usize,
	pub msg: &'static str,
}

struct Input<'a> {
	text: &'a str,
	pos: usize,
}

type PResult<T> = std::result::Result<T, ParseError>;

impl<'a> Input<'a> {
	fn current_char(&self) -> Option<char> {
		self.text[self.pos..].chars().next()
	}

	fn advance(&mut self) {
		if let Some(c) = self.current_char() {
			self.pos += c.len_utf8();
		}
	}

	fn error(&self, msg: &'static str) -> ParseError {
		ParseError {
			input: self.text.to_string(),
			offset: self.pos,
			msg,
		}
	}

	fn one(&mut self, expected: char) -> PResult<()> {
		match self.current_char() {
			Some(c) if c == expected => {
				self.advance();
				Ok(())
			}
			_ => Err(self.error("unexpected character")),
		}
	}

	fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
		let start = self.pos;
		while let Some(c) = self.current_char() {
			if !pred(c) {
				break;
			}
			self.advance();
		}
		&self.text[start..self.pos]
	}
}

fn is_identifier_char(c: char) -> bool {
	c.is_alphanumeric() || c == '_'
}

fn identifier<'a>(i: &mut Input<'a>) -> PResult<&'a str> {
	match i.current_char() {
		Some(c) if c.is_alphabetic() || c == '_' => Ok(i.take_while(is_identifier_char)),
		_ => Err(i.error("expected identifier")),
	}
}

fn variant_selection(i: &mut Input, path: &sdf::Path) -> PResult<sdf::Path> {
	i.one('{')?;
	i.take_while(char::is_whitespace);
	let variant_set = identifier(i)?;
	i.take_while(char::is_whitespace);
	i.one('=')?;
	i.take_while(char::is_whitespace);
	let variant = i.take_while(|c| is_identifier_char(c) || c == '-' || c == '|');
	i.take_while(char::is_whitespace);
	i.one('}')?;

	Ok(path.append_variant_selection(variant_set, variant))
}

fn property_name<'a>(i: &mut Input<'a>) -> PResult<&'a str> {
	let start = i.pos;
	identifier(i)?;
	while i.current_char() == Some(':') {
		i.advance();
		identifier(i)?;
	}
	Ok(&i.text[start..i.pos])
}

/// Parses an absolute path such as `/World/Set{look=red}Chair.size`.
pub fn parse_path(text: &str) -> PResult<sdf::Path> {
	let mut i = Input { text, pos: 0 };

	i.one('/')?;
	let mut path = sdf::Path::absolute_root_path();

	if i.current_char().is_none() {
		return Ok(path);
	}

	path = path.append_child(&tf::Token::new(identifier(&mut i)?));

	loop {
		match i.current_char() {
			None => return Ok(path),
			Some('/') => {
				i.advance();
				path = path.append_child(&tf::Token::new(identifier(&mut i)?));
			}
			Some('{') => {
				path = variant_selection(&mut i, &path)?;
				// A prim name may directly follow a variant selection.
				if matches!(i.current_char(), Some(c) if c.is_alphabetic() || c == '_') {
					path = path.append_child(&tf::Token::new(identifier(&mut i)?));
				}
			}
			Some('.') => {
				i.advance();
				let name = property_name(&mut i)?;
				if i.current_char().is_some() {
					return Err(i.error("trailing characters after property name"));
				}
				return Ok(path.append_property(&tf::Token::new(name)));
			}
			Some(_) => return Err(i.error("unexpected character")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_absolute_paths() {
		assert!(parse_path("/").unwrap().is_absolute_root());
		assert!(parse_path("/A/B").unwrap().is_prim_path());
		assert!(parse_path("/A.b:c").unwrap().is_property_path());
		assert!(parse_path("/A{v=}").unwrap().is_prim_variant_selection_path());
		assert_eq!(
			parse_path("/A{ v = x }B").unwrap().to_string(),
			"/A{v=x}B"
		);
	}

	#[test]
	fn rejects_malformed_paths() {
		assert!(parse_path("").is_err());
		assert!(parse_path("A/B").is_err());
		assert!(parse_path("/A//B").is_err());
		assert!(parse_path("/A.b.c").is_err());
		assert!(parse_path("/A{v=x").is_err());
		assert_eq!(parse_path("/A/").unwrap_err().offset, 3);
	}
}

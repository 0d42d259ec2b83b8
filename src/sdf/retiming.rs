/// Represents a time offset and scale between layers.
#[derive(Debug, Clone, Copy)]
pub struct Retiming {
	pub offset: f64,
	pub scale: f64,
}

impl Retiming {
	pub const IDENTITY: Self = Self {
		offset: 0.0,
		scale: 1.0,
	};

	pub const fn new(offset: f64, scale: f64) -> Self {
		Self { offset, scale }
	}

	pub fn is_identity(&self) -> bool {
		*self == Self::IDENTITY
	}

	pub fn inv(&self) -> Self {
		if self.is_identity() {
			return *self;
		}
		Self {
			offset: -self.offset / self.scale,
			scale: 1.0 / self.scale,
		}
	}
}

impl Default for Retiming {
	fn default() -> Self {
		Self::IDENTITY
	}
}

/// Composes two retimings; `(a * b) * t == a * (b * t)`.
impl std::ops::Mul for Retiming {
	type Output = Self;

	fn mul(self, rhs: Self) -> Self {
		Self {
			offset: rhs.offset * self.scale + self.offset,
			scale: rhs.scale * self.scale,
		}
	}
}

impl std::ops::Mul<f64> for Retiming {
	type Output = f64;

	fn mul(self, rhs: f64) -> f64 {
		rhs * self.scale + self.offset
	}
}

impl PartialEq for Retiming {
	fn eq(&self, other: &Self) -> bool {
		self.offset.to_bits() == other.offset.to_bits()
			&& self.scale.to_bits() == other.scale.to_bits()
	}
}

impl Eq for Retiming {}

impl std::hash::Hash for Retiming {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.offset.to_bits().hash(state);
		self.scale.to_bits().hash(state);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn compose_and_invert() {
		let a = Retiming::new(10.0, 2.0);
		let b = Retiming::new(5.0, 1.0);
		assert_eq!((a * b) * 1.0, a * (b * 1.0));
		assert_eq!(a * a.inv(), Retiming::IDENTITY);
		assert!(Retiming::default().is_identity());
	}
}

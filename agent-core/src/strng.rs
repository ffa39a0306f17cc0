//! Cheap-clone interned string used pervasively as resource and type_url identity.
//!
//! Cloning a `Strng` is an atomic refcount bump, not an allocation + copy, which matters because
//! resource names and type URLs are copied into every watch index, subscription-state key and ack
//! queue entry.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use arcstr::ArcStr;
use serde::{Deserialize, Serialize};

#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct Strng(ArcStr);

pub type RichStrng = Strng;

impl Strng {
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
}

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng(ArcStr::from(s.as_ref()))
}

/// A `&'static str` constructor that never allocates; mirrors `arcstr::literal!`.
macro_rules! literal {
	($s:expr) => {
		$crate::strng::Strng::from_static($s)
	};
}
pub use literal;

/// Formats into a `Strng`, analogous to `format!` but producing the interned type directly.
macro_rules! format {
	($($arg:tt)*) => {
		$crate::strng::new(::std::format!($($arg)*))
	};
}
pub use format;

impl Strng {
	pub fn from_static(s: &'static str) -> Strng {
		Strng(ArcStr::from(s))
	}
}

impl Deref for Strng {
	type Target = str;
	fn deref(&self) -> &str {
		self.0.as_str()
	}
}

impl Borrow<str> for Strng {
	fn borrow(&self) -> &str {
		self.0.as_str()
	}
}

impl AsRef<str> for Strng {
	fn as_ref(&self) -> &str {
		self.0.as_str()
	}
}

impl fmt::Display for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl fmt::Debug for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.0, f)
	}
}

impl From<&str> for Strng {
	fn from(s: &str) -> Self {
		new(s)
	}
}

impl From<String> for Strng {
	fn from(s: String) -> Self {
		Strng(ArcStr::from(s))
	}
}

impl From<&String> for Strng {
	fn from(s: &String) -> Self {
		new(s)
	}
}

impl Serialize for Strng {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.0.serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for Strng {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		Ok(Strng(ArcStr::deserialize(deserializer)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clone_is_cheap_and_equal() {
		let a = new("Cluster");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "Cluster");
	}

	#[test]
	fn format_macro_builds_strng() {
		let name: Strng = format!("{}.{}", "foo", "bar");
		assert_eq!(name.as_str(), "foo.bar");
	}

	#[test]
	fn usable_as_hashmap_key_by_borrow() {
		use std::collections::HashMap;
		let mut m: HashMap<Strng, u32> = HashMap::new();
		m.insert(new("Cluster"), 1);
		assert_eq!(m.get("Cluster"), Some(&1));
	}
}

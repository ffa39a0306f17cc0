//! Cross-type FIFO of pending (N)ACKs (§3 AckQueue, §4.C). The multiplexer appends one entry per
//! response processed and scans from the front when deciding what to send next; a paused
//! type_url's entries are skipped in place rather than removed, so they keep their relative order
//! once the type_url resumes.

use std::collections::{HashSet, VecDeque};

use agent_core::strng::Strng;

#[derive(Clone, Debug)]
pub struct AckEntry {
	pub type_url: Strng,
}

#[derive(Default)]
pub struct AckQueue {
	entries: VecDeque<AckEntry>,
	paused: HashSet<Strng>,
}

impl AckQueue {
	pub fn new() -> Self {
		AckQueue::default()
	}

	pub fn push(&mut self, type_url: Strng) {
		self.entries.push_back(AckEntry { type_url });
	}

	pub fn pause(&mut self, type_url: Strng) {
		self.paused.insert(type_url);
	}

	pub fn resume(&mut self, type_url: &str) {
		self.paused.remove(type_url);
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Removes and returns the first entry whose type_url is not currently paused, preserving the
	/// relative order of everything left behind.
	pub fn take_next_ready(&mut self) -> Option<AckEntry> {
		let pos = self.entries.iter().position(|e| !self.paused.contains(e.type_url.as_str()))?;
		self.entries.remove(pos)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn paused_type_url_is_skipped_but_keeps_position() {
		let mut q = AckQueue::new();
		q.push(Strng::from("Cluster"));
		q.push(Strng::from("Listener"));
		q.pause(Strng::from("Cluster"));

		let next = q.take_next_ready().unwrap();
		assert_eq!(next.type_url.as_str(), "Listener");
		assert_eq!(q.len(), 1);

		q.resume("Cluster");
		let next = q.take_next_ready().unwrap();
		assert_eq!(next.type_url.as_str(), "Cluster");
		assert!(q.is_empty());
	}

	#[test]
	fn fifo_order_preserved_among_unpaused_entries() {
		let mut q = AckQueue::new();
		q.push(Strng::from("A"));
		q.push(Strng::from("B"));
		q.push(Strng::from("A"));
		assert_eq!(q.take_next_ready().unwrap().type_url.as_str(), "A");
		assert_eq!(q.take_next_ready().unwrap().type_url.as_str(), "B");
		assert_eq!(q.take_next_ready().unwrap().type_url.as_str(), "A");
		assert!(q.take_next_ready().is_none());
	}
}

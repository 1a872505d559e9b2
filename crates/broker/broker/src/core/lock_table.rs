//! Exclusive per-file edit locks.
//!
//! Each file is either unlocked or locked by exactly one connection. There is
//! no expiry: a stalled client keeps its lock until it closes the file,
//! releases the lock, or disconnects.

use std::collections::{BTreeSet, HashMap};

use codeshare_proto::ConnectionId;

use crate::config::EditPolicy;

/// Result of [`LockTable::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
	/// The caller now holds the lock (or already did).
	Granted,
	/// Another connection holds the lock.
	Denied(ConnectionId),
}

/// Returned by [`LockTable::release`] when the caller is not the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotOwner;

/// Lock holders keyed by file name, with a reverse index per connection.
///
/// Both views are updated together so a connection's held set always equals
/// the files whose holder is that connection.
#[derive(Debug, Default)]
pub struct LockTable {
	holders: HashMap<String, ConnectionId>,
	held: HashMap<ConnectionId, BTreeSet<String>>,
}

impl LockTable {
	/// Grants the lock if the file is unlocked or already held by `conn`.
	///
	/// A denial leaves the table untouched.
	pub fn acquire(&mut self, file: &str, conn: ConnectionId) -> Acquire {
		match self.holders.get(file) {
			Some(&holder) if holder != conn => Acquire::Denied(holder),
			Some(_) => Acquire::Granted,
			None => {
				self.holders.insert(file.to_string(), conn);
				self.held.entry(conn).or_default().insert(file.to_string());
				Acquire::Granted
			}
		}
	}

	/// Releases the lock if `conn` holds it.
	pub fn release(&mut self, file: &str, conn: ConnectionId) -> Result<(), NotOwner> {
		if self.holders.get(file) != Some(&conn) {
			return Err(NotOwner);
		}
		self.holders.remove(file);
		if let Some(files) = self.held.get_mut(&conn) {
			files.remove(file);
			if files.is_empty() {
				self.held.remove(&conn);
			}
		}
		Ok(())
	}

	/// Releases every lock held by `conn` and returns the released names.
	pub fn release_all(&mut self, conn: ConnectionId) -> Vec<String> {
		let files: Vec<String> = self.held.remove(&conn).unwrap_or_default().into_iter().collect();
		for file in &files {
			self.holders.remove(file);
		}
		files
	}

	/// Drops any lock on `file` regardless of holder. Used when a file is deleted.
	pub fn clear(&mut self, file: &str) {
		if let Some(holder) = self.holders.remove(file)
			&& let Some(files) = self.held.get_mut(&holder)
		{
			files.remove(file);
			if files.is_empty() {
				self.held.remove(&holder);
			}
		}
	}

	/// Current holder of `file`.
	pub fn holder(&self, file: &str) -> Option<ConnectionId> {
		self.holders.get(file).copied()
	}

	/// True when a connection other than `conn` holds `file`.
	pub fn is_locked_by_other(&self, file: &str, conn: ConnectionId) -> bool {
		self.holder(file).is_some_and(|h| h != conn)
	}

	/// Whether `conn` may overwrite `file` under `policy`.
	pub fn can_write(&self, file: &str, conn: ConnectionId, policy: EditPolicy) -> bool {
		match policy {
			EditPolicy::Holder => self.holder(file) == Some(conn),
			EditPolicy::UnlockedOrHolder => !self.is_locked_by_other(file, conn),
		}
	}

	/// Files held by `conn`.
	pub fn held_by(&self, conn: ConnectionId) -> Vec<String> {
		self.held
			.get(&conn)
			.map(|files| files.iter().cloned().collect())
			.unwrap_or_default()
	}

	#[cfg(test)]
	pub(crate) fn assert_consistent(&self) {
		for (file, holder) in &self.holders {
			assert!(
				self.held.get(holder).is_some_and(|f| f.contains(file)),
				"{file} held by {holder} missing from reverse index"
			);
		}
		for (conn, files) in &self.held {
			assert!(!files.is_empty(), "empty held set for {conn}");
			for file in files {
				assert_eq!(self.holders.get(file), Some(conn));
			}
		}
	}
}

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use roomcast_domain::{RoomId, UserId};

use crate::config::AccessSettings;

/// Who may join which room.
#[derive(Debug, Clone)]
pub struct RoomAccess {
	default_open: bool,
	participants: HashMap<RoomId, BTreeSet<UserId>>,
}

impl RoomAccess {
	/// Every room open to every authenticated user.
	pub fn open() -> Self {
		Self {
			default_open: true,
			participants: HashMap::new(),
		}
	}

	pub fn from_settings(settings: &AccessSettings) -> Self {
		let mut participants = HashMap::new();
		for (room, users) in &settings.rooms {
			let Ok(room) = RoomId::new(room.clone()) else {
				tracing::warn!(room = %room, "access: skipping invalid room id");
				continue;
			};
			let users = users.iter().filter_map(|u| UserId::new(u.clone()).ok()).collect();
			participants.insert(room, users);
		}

		Self {
			default_open: settings.default_open,
			participants,
		}
	}

	/// Restrict `room` to the given participants.
	pub fn restrict(mut self, room: RoomId, users: impl IntoIterator<Item = UserId>) -> Self {
		self.participants.insert(room, users.into_iter().collect());
		self
	}

	pub fn can_join(&self, user: &UserId, room: &RoomId) -> bool {
		match self.participants.get(room) {
			Some(users) => users.contains(user),
			None => self.default_open,
		}
	}
}

impl Default for RoomAccess {
	fn default() -> Self {
		Self::open()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;

	fn room(s: &str) -> RoomId {
		RoomId::new(s).unwrap()
	}

	fn user(s: &str) -> UserId {
		UserId::new(s).unwrap()
	}

	#[test]
	fn listed_rooms_only_admit_participants() {
		let access = RoomAccess::open().restrict(room("staff"), [user("alice")]);
		assert!(access.can_join(&user("alice"), &room("staff")));
		assert!(!access.can_join(&user("bob"), &room("staff")));
		assert!(access.can_join(&user("bob"), &room("lobby")));
	}

	#[test]
	fn closed_default_rejects_unlisted_rooms() {
		let mut rooms = BTreeMap::new();
		rooms.insert("ops".to_string(), ["carol".to_string()].into_iter().collect());
		let access = RoomAccess::from_settings(&AccessSettings {
			default_open: false,
			rooms,
		});

		assert!(access.can_join(&user("carol"), &room("ops")));
		assert!(!access.can_join(&user("carol"), &room("lobby")));
	}
}

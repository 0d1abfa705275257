//! Realtime message parsing and the mapping from event types to cache groups.

// self
use crate::{_prelude::*, realtime::RealtimeError};

/// Named cache group the data layer refetches when invalidated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheGroup {
	/// Order lists and order details.
	Orders,
	/// Inventory lookups.
	Inventory,
	/// Dashboard aggregates derived from orders and inventory.
	Dashboard,
}
impl CacheGroup {
	/// Every group, in a stable order.
	pub const ALL: [CacheGroup; 3] = [CacheGroup::Orders, CacheGroup::Inventory, CacheGroup::Dashboard];

	/// Returns the group's wire name.
	pub const fn as_str(self) -> &'static str {
		match self {
			CacheGroup::Orders => "orders",
			CacheGroup::Inventory => "inventory",
			CacheGroup::Dashboard => "dashboard",
		}
	}
}
impl Display for CacheGroup {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Recognized event categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCategory {
	/// An order was created, updated, or shipped.
	OrderChanged,
	/// Stock levels changed.
	InventoryChanged,
}
impl EventCategory {
	/// Classifies a `type` discriminator; unknown discriminators yield `None`.
	pub fn classify(kind: &str) -> Option<Self> {
		match kind {
			"new_order" | "order_created" | "order_updated" | "order_shipped" =>
				Some(EventCategory::OrderChanged),
			"inventory_updated" | "inventory_low" => Some(EventCategory::InventoryChanged),
			_ => None,
		}
	}

	/// Cache groups made stale by this category.
	pub const fn groups(self) -> &'static [CacheGroup] {
		match self {
			EventCategory::OrderChanged => &[CacheGroup::Orders, CacheGroup::Dashboard],
			EventCategory::InventoryChanged => &[CacheGroup::Inventory, CacheGroup::Dashboard],
		}
	}
}

/// Parsed realtime message.
#[derive(Clone, Debug, PartialEq)]
pub struct RealtimeEvent {
	/// Raw `type` discriminator.
	pub kind: String,
	/// Category, when the discriminator is recognized.
	pub category: Option<EventCategory>,
	/// Optional payload carried alongside the discriminator.
	pub data: serde_json::Value,
}
impl RealtimeEvent {
	/// Parses a text frame. Frames without a string `type` are malformed.
	pub fn parse(raw: &str) -> Result<Self, RealtimeError> {
		let envelope: Envelope = serde_json::from_str(raw).map_err(RealtimeError::Malformed)?;
		let category = EventCategory::classify(&envelope.kind);

		Ok(Self { kind: envelope.kind, category, data: envelope.data })
	}

	/// Cache groups this event invalidates; empty for unrecognized discriminators.
	pub fn invalidates(&self) -> &'static [CacheGroup] {
		self.category.map(EventCategory::groups).unwrap_or(&[])
	}
}

#[derive(Deserialize)]
struct Envelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	data: serde_json::Value,
}

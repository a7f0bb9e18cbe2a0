use crate::{EntityPayload, EntityType};

use std::collections::{hash_map::Entry, HashMap};

use serde_json::{Map, Value};

/// Walks an arbitrary JSON payload and collects every nested object that describes a known
/// entity kind, so a single response (a task with its embedded assignee, a deleted user with
/// its tasks) can feed more than one registry bucket.
///
/// Objects are visited children first. When the same entity shows up more than once the later
/// occurrence wins, but keeps the position of the first one. Shapes that are not entities are
/// skipped silently.
#[must_use]
pub fn collect_entities(payload: &Value) -> Vec<EntityPayload> {
	let mut collector = Collector::default();
	collector.visit(payload);
	collector.entities
}

#[derive(Default)]
struct Collector {
	entities: Vec<EntityPayload>,
	positions: HashMap<(EntityType, String), usize>,
}

impl Collector {
	fn visit(&mut self, value: &Value) {
		match value {
			Value::Array(items) => items.iter().for_each(|item| self.visit(item)),
			Value::Object(object) => {
				object.values().for_each(|child| self.visit(child));

				if let Some(entity) = as_entity(object) {
					self.push(entity);
				}
			}
			_ => {}
		}
	}

	fn push(&mut self, entity: EntityPayload) {
		match self.positions.entry((entity.entity_type, entity.id.clone())) {
			Entry::Occupied(position) => self.entities[*position.get()] = entity,
			Entry::Vacant(slot) => {
				slot.insert(self.entities.len());
				self.entities.push(entity);
			}
		}
	}
}

fn as_entity(object: &Map<String, Value>) -> Option<EntityPayload> {
	// Cheap shape check before cloning the whole object.
	let is_entity = matches!(
		(object.get("entityType"), object.get("id")),
		(Some(Value::String(tag)), Some(Value::String(_))) if tag.parse::<EntityType>().is_ok()
	);

	if is_entity {
		EntityPayload::from_map(object.clone()).ok()
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	#[test]
	fn finds_entities_nested_anywhere() {
		let entities = collect_entities(&json!({
			"users": [{ "id": "u1", "entityType": "user", "fullName": "Ada" }],
			"tasks": [{
				"id": "t1",
				"entityType": "task",
				"assignee": { "id": "u2", "entityType": "user" },
			}],
		}));

		let mut keys = entities.iter().map(EntityPayload::key).collect::<Vec<_>>();
		keys.sort_unstable();

		assert_eq!(
			keys,
			vec![
				(EntityType::User, "u1"),
				(EntityType::User, "u2"),
				(EntityType::Task, "t1"),
			]
		);
	}

	#[test]
	fn ignores_shapes_that_are_not_entities() {
		let entities = collect_entities(&json!([
			{ "id": "x", "entityType": "comment" },
			{ "id": 5, "entityType": "task" },
			{ "entityType": "user" },
			"task",
			null,
		]));

		assert!(entities.is_empty());
	}

	#[test]
	fn later_occurrence_of_the_same_id_wins() {
		let entities = collect_entities(&json!([
			{ "id": "t1", "entityType": "task", "status": "TODO" },
			{ "id": "t1", "entityType": "task", "status": "DONE" },
		]));

		assert_eq!(entities.len(), 1);
		assert_eq!(entities[0].field("status"), Some(&json!("DONE")));
	}
}

//! Attribute path grammar.
//!
//! `a.b.c` walks nested attributes; `list#2` indexes a collection or array;
//! `list#k42` looks up a collection member by id or cid. Empty segments are
//! skipped.

use crate::value::{Attributes, Value};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    /// `.name`
    Key(String),
    /// `#selector`
    Index(String),
}

pub(crate) fn parse(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut pieces = part.split('#');
        if let Some(name) = pieces.next().filter(|name| !name.is_empty()) {
            segments.push(Segment::Key(name.to_owned()));
        }
        segments.extend(
            pieces
                .filter(|selector| !selector.is_empty())
                .map(|selector| Segment::Index(selector.to_owned())),
        );
    }
    segments
}

/// Resolves one segment against the value reached so far.
pub(crate) fn step(current: &Value, segment: &Segment) -> Option<Value> {
    let (Segment::Key(key) | Segment::Index(key)) = segment;
    match current {
        Value::Entity(entity) => entity.resolve(key),
        Value::Collection(collection) => {
            let member = match key.parse::<isize>() {
                Ok(index) => collection.at(index),
                Err(_) => collection.get(key.as_str()),
            };
            member.map(Value::Entity)
        }
        Value::Json(Json::Object(map)) => map.get(key).cloned().map(Value::Json),
        Value::Json(Json::Array(items)) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .cloned()
            .map(Value::Json),
        _ => None,
    }
}

/// Expands a dotted key into a nested attribute map:
/// `("meta.author", "A")` becomes `{meta: {author: "A"}}`.
///
/// Only JSON values nest; anything else is stored under the literal key.
pub(crate) fn nest(key: &str, value: Value) -> Attributes {
    let parts: Vec<&str> = key.split('.').filter(|part| !part.is_empty()).collect();
    let (root, rest) = match parts.split_first() {
        Some((root, rest)) if !rest.is_empty() => (*root, rest),
        _ => return Attributes::from([(key.to_owned(), value)]),
    };
    let Value::Json(mut json) = value else {
        return Attributes::from([(key.to_owned(), value)]);
    };
    for part in rest.iter().rev() {
        let mut map = Map::new();
        map.insert((*part).to_owned(), json);
        json = Json::Object(map);
    }
    Attributes::from([(root.to_owned(), Value::Json(json))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parse_mixes_keys_and_selectors() {
        assert_eq!(
            parse("items#2.name"),
            vec![
                Segment::Key("items".into()),
                Segment::Index("2".into()),
                Segment::Key("name".into()),
            ]
        );
    }

    #[test]
    fn parse_skips_empty_segments() {
        assert_eq!(parse("a..b#"), vec![Segment::Key("a".into()), Segment::Key("b".into())]);
        assert!(parse("").is_empty());
    }

    #[test]
    fn nest_builds_intermediate_objects() {
        let attrs = nest("meta.author.name", Value::from("Ann"));
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs["meta"], json!({"author": {"name": "Ann"}}));
    }

    #[test]
    fn nest_keeps_flat_keys() {
        let attrs = nest("title", Value::from("x"));
        assert_eq!(attrs["title"], json!("x"));
    }
}

use std::collections::HashSet;
use url::Url;

use super::ContentNode;

/// Path under which uploaded images are served
pub const IMAGE_API_PATH_PREFIX: &str = "/api/v1/images/";
/// Image ids are ULIDs
pub const IMAGE_ID_LENGTH: usize = 26;

const DATA_IMAGE_PREFIX: &str = "data:image/";
// Relative references are resolved against a placeholder origin; only the path matters.
const PLACEHOLDER_ORIGIN: &str = "https://mdsync.local";

/// Source an image node actually points at.
///
/// Nodes still uploading have none. Otherwise the final `dataSrc` wins over
/// `src`, which may hold a local preview while an upload is in flight.
/// Empty values and inline `data:image/` previews are skipped.
pub fn effective_image_source(node: &ContentNode) -> Option<&str> {
    if node.attr_bool("uploading") {
        return None;
    }

    ["dataSrc", "src"]
        .into_iter()
        .filter_map(|name| node.attr_str(name))
        .map(str::trim)
        .find(|source| !source.is_empty() && !source.starts_with(DATA_IMAGE_PREFIX))
}

/// Extract the image id from a reference to the image-serving path.
///
/// Returns `None` for inline data, external URLs and malformed ids.
pub fn extract_image_id_from_source(source: &str) -> Option<String> {
    if source.starts_with("data:") {
        return None;
    }

    let url = Url::parse(PLACEHOLDER_ORIGIN)
        .and_then(|base| base.join(source))
        .ok()?;
    let id = url
        .path()
        .strip_prefix(IMAGE_API_PATH_PREFIX)?
        .trim_end_matches('/');

    if id.len() != IMAGE_ID_LENGTH || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    Some(id.to_string())
}

/// Ids of every uploaded image the content tree references
pub fn collect_referenced_image_ids(root: &ContentNode) -> HashSet<String> {
    let mut ids = HashSet::new();
    root.walk(&mut |node| {
        if node.kind != "image" {
            return;
        }
        if let Some(id) = effective_image_source(node).and_then(extract_image_id_from_source) {
            ids.insert(id);
        }
    });
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    const FIRST: &str = "01HZX3T47PW5Z7F73Q0Z6E4TQ3";
    const SECOND: &str = "01HZX3T47PW5Z7F73Q0Z6E4TQ4";

    fn node(value: serde_json::Value) -> ContentNode {
        serde_json::from_value(value).unwrap()
    }

    #[rstest]
    #[case("/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ3", Some(FIRST))]
    #[case("/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ3/", Some(FIRST))]
    #[case("https://example.com/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ3?cache=1", Some(FIRST))]
    #[case("data:image/png;base64,xxx", None)]
    #[case("/images/01HZX3T47PW5Z7F73Q0Z6E4TQ3", None)]
    #[case("/api/v1/images/not-valid-id", None)]
    #[case("/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ", None)]
    #[case("", None)]
    fn test_extract_image_id(#[case] source: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            extract_image_id_from_source(source).as_deref(),
            expected
        );
    }

    #[test]
    fn test_collects_ids_recursively() {
        let content = node(json!({
            "type": "doc",
            "content": [
                {"type": "paragraph", "content": [
                    {"type": "image", "attrs": {"src": format!("/api/v1/images/{FIRST}")}}
                ]},
                {"type": "image", "attrs": {
                    "src": "data:image/svg+xml,placeholder",
                    "dataSrc": format!("https://example.com/api/v1/images/{SECOND}")
                }}
            ]
        }));

        let mut ids: Vec<_> = collect_referenced_image_ids(&content).into_iter().collect();
        ids.sort();
        assert_eq!(ids, vec![FIRST, SECOND]);
    }

    #[test]
    fn test_ignores_invalid_or_missing_sources() {
        let content = node(json!({
            "type": "doc",
            "content": [
                {"type": "image", "attrs": {"src": "/api/v1/images/not-valid-id"}},
                {"type": "image"},
                {"type": "paragraph", "attrs": {"src": format!("/api/v1/images/{FIRST}")}}
            ]
        }));

        assert!(collect_referenced_image_ids(&content).is_empty());
    }

    #[test]
    fn test_uploading_placeholder_is_never_referenced() {
        let content = node(json!({
            "type": "doc",
            "content": [
                {"type": "image", "attrs": {
                    "src": format!("/api/v1/images/{FIRST}"),
                    "uploading": true
                }}
            ]
        }));

        assert!(collect_referenced_image_ids(&content).is_empty());
    }

    #[test]
    fn test_final_source_preferred_over_preview() {
        let image = node(json!({
            "type": "image",
            "attrs": {
                "src": format!("/api/v1/images/{FIRST}"),
                "dataSrc": format!("/api/v1/images/{SECOND}")
            }
        }));

        let expected = format!("/api/v1/images/{SECOND}");
        assert_eq!(effective_image_source(&image), Some(expected.as_str()));
        let ids = collect_referenced_image_ids(&ContentNode::doc(vec![image]));
        assert!(ids.contains(SECOND));
        assert!(!ids.contains(FIRST));
    }
}

use serde_json::Value as JsonValue;

use super::images::effective_image_source;
use super::{ContentNode, Mark};

/// Prepare a content tree for markdown export.
///
/// Images still uploading or without a usable source are dropped, and the
/// final `dataSrc` reference is folded into `src`.
pub fn normalize_for_export(root: &ContentNode) -> ContentNode {
    normalize_node(root).unwrap_or_else(|| ContentNode::doc(vec![]))
}

fn normalize_node(node: &ContentNode) -> Option<ContentNode> {
    let content = node.content.iter().filter_map(normalize_node).collect();

    if node.kind == "image" {
        let source = effective_image_source(node)?.to_string();
        let mut attrs = node.attrs.clone();
        attrs.remove("dataSrc");
        attrs.insert("src".to_string(), JsonValue::String(source));
        return Some(ContentNode {
            attrs,
            content,
            ..node.clone()
        });
    }

    Some(ContentNode {
        content,
        ..node.clone()
    })
}

/// Render a content tree to markdown text
pub fn render_markdown(root: &ContentNode) -> String {
    let blocks = if root.kind == "doc" {
        render_blocks(&root.content)
    } else {
        render_blocks(std::slice::from_ref(root))
    };

    if blocks.is_empty() {
        String::new()
    } else {
        format!("{}\n", blocks)
    }
}

fn render_blocks(nodes: &[ContentNode]) -> String {
    nodes
        .iter()
        .map(render_block)
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_block(node: &ContentNode) -> String {
    match node.kind.as_str() {
        "paragraph" => render_inline(&node.content),
        "heading" => {
            let level = node
                .attrs
                .get("level")
                .and_then(JsonValue::as_u64)
                .unwrap_or(1)
                .clamp(1, 6) as usize;
            format!("{} {}", "#".repeat(level), render_inline(&node.content))
        }
        "blockquote" => prefix_lines(&render_blocks(&node.content), "> ", ">"),
        "bulletList" => render_list(node, |_| "- ".to_string()),
        "orderedList" => {
            let start = node
                .attrs
                .get("start")
                .and_then(JsonValue::as_u64)
                .unwrap_or(1);
            render_list(node, |index| {
                format!("{}. ", start.saturating_add(index as u64))
            })
        }
        "taskList" => render_list(node, |_| "- ".to_string()),
        "codeBlock" => {
            let language = node.attr_str("language").unwrap_or_default();
            format!("```{}\n{}\n```", language, node.plain_text())
        }
        "horizontalRule" => "---".to_string(),
        "text" | "image" | "hardBreak" => render_inline(std::slice::from_ref(node)),
        _ if node.content.iter().any(ContentNode::is_text) => render_inline(&node.content),
        _ => render_blocks(&node.content),
    }
}

fn render_list<F>(list: &ContentNode, marker: F) -> String
where
    F: Fn(usize) -> String,
{
    list.content
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut bullet = marker(index);
            if item.kind == "taskItem" {
                let checked = if item.attr_bool("checked") { "x" } else { " " };
                bullet.push_str(&format!("[{}] ", checked));
            }
            let indent = " ".repeat(bullet.len());
            let body = render_list_item(item);
            let mut lines = body.lines();
            let first = lines.next().unwrap_or_default();
            let mut out = format!("{}{}", bullet, first);
            for line in lines {
                out.push('\n');
                if !line.is_empty() {
                    out.push_str(&indent);
                    out.push_str(line);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// Nested lists hug their parent item; other blocks keep a blank line.
fn render_list_item(item: &ContentNode) -> String {
    let mut out = String::new();
    for child in &item.content {
        let block = render_block(child);
        if block.is_empty() {
            continue;
        }
        if !out.is_empty() {
            let nested_list = matches!(
                child.kind.as_str(),
                "bulletList" | "orderedList" | "taskList"
            );
            out.push_str(if nested_list { "\n" } else { "\n\n" });
        }
        out.push_str(&block);
    }
    out
}

fn prefix_lines(text: &str, prefix: &str, empty_prefix: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                empty_prefix.to_string()
            } else {
                format!("{}{}", prefix, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_inline(nodes: &[ContentNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node.kind.as_str() {
            "text" => out.push_str(&render_text(node.text.as_deref().unwrap_or_default(), &node.marks)),
            "hardBreak" => out.push_str("  \n"),
            "image" => {
                let src = node.attr_str("src").unwrap_or_default();
                let alt = node.attr_str("alt").unwrap_or_default();
                match node.attr_str("title").filter(|title| !title.is_empty()) {
                    Some(title) => out.push_str(&format!("![{}]({} \"{}\")", alt, src, title)),
                    None => out.push_str(&format!("![{}]({})", alt, src)),
                }
            }
            _ => out.push_str(&render_inline(&node.content)),
        }
    }
    out
}

fn render_text(text: &str, marks: &[Mark]) -> String {
    if text.is_empty() {
        return String::new();
    }

    let has = |kind: &str| marks.iter().any(|mark| mark.kind == kind);
    let mut out = text.to_string();

    if has("code") {
        out = format!("`{}`", out);
    }
    if has("bold") {
        out = format!("**{}**", out);
    }
    if has("italic") {
        out = format!("*{}*", out);
    }
    if has("strike") {
        out = format!("~~{}~~", out);
    }
    if let Some(link) = marks.iter().find(|mark| mark.kind == "link") {
        let href = link
            .attrs
            .get("href")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        out = format!("[{}]({})", out, href);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(value: serde_json::Value) -> String {
        let content: ContentNode = serde_json::from_value(value).unwrap();
        render_markdown(&normalize_for_export(&content))
    }

    fn paragraph_with(node: serde_json::Value) -> serde_json::Value {
        json!({"type": "doc", "content": [{"type": "paragraph", "content": [node]}]})
    }

    #[test]
    fn test_prefers_data_src_over_placeholder() {
        let markdown = render(paragraph_with(json!({
            "type": "image",
            "attrs": {
                "src": "data:image/svg+xml,placeholder",
                "dataSrc": "/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ3",
                "alt": "test image"
            }
        })));

        assert!(markdown.contains("![test image](/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ3)"));
        assert!(!markdown.contains("data:image/svg+xml"));
    }

    #[test]
    fn test_uses_src_without_data_src() {
        let markdown = render(paragraph_with(json!({
            "type": "image",
            "attrs": {"src": "/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ4", "alt": "fallback image"}
        })));

        assert!(markdown.contains("![fallback image](/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ4)"));
    }

    #[test]
    fn test_uploading_images_are_dropped() {
        let markdown = render(paragraph_with(json!({
            "type": "image",
            "attrs": {
                "src": "/api/v1/images/01HZX3T47PW5Z7F73Q0Z6E4TQ5",
                "uploading": true,
                "alt": "uploading image"
            }
        })));

        assert!(!markdown.contains("![uploading image]"));
        assert_eq!(markdown.trim(), "");
    }

    #[test]
    fn test_plain_paragraph() {
        let markdown = render(paragraph_with(json!({"type": "text", "text": "hello world"})));
        assert_eq!(markdown.trim(), "hello world");
    }

    #[test]
    fn test_blocks_and_marks() {
        let markdown = render(json!({
            "type": "doc",
            "content": [
                {"type": "heading", "attrs": {"level": 2}, "content": [{"type": "text", "text": "Notes"}]},
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "strong", "marks": [{"type": "bold"}]},
                    {"type": "text", "text": " and "},
                    {"type": "text", "text": "docs", "marks": [{"type": "link", "attrs": {"href": "https://example.com"}}]}
                ]},
                {"type": "bulletList", "content": [
                    {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "one"}]}]},
                    {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "two"}]}]}
                ]},
                {"type": "codeBlock", "attrs": {"language": "rust"}, "content": [{"type": "text", "text": "fn main() {}"}]},
                {"type": "blockquote", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "quoted"}]}]},
                {"type": "horizontalRule"}
            ]
        }));

        assert_eq!(
            markdown,
            "## Notes\n\n**strong** and [docs](https://example.com)\n\n- one\n- two\n\n```rust\nfn main() {}\n```\n\n> quoted\n\n---\n"
        );
    }

    #[test]
    fn test_ordered_and_task_lists() {
        let markdown = render(json!({
            "type": "doc",
            "content": [
                {"type": "orderedList", "attrs": {"start": 3}, "content": [
                    {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "three"}]}]},
                    {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "four"}]}]}
                ]},
                {"type": "taskList", "content": [
                    {"type": "taskItem", "attrs": {"checked": true}, "content": [{"type": "paragraph", "content": [{"type": "text", "text": "done"}]}]},
                    {"type": "taskItem", "attrs": {"checked": false}, "content": [{"type": "paragraph", "content": [{"type": "text", "text": "todo"}]}]}
                ]}
            ]
        }));

        assert_eq!(markdown, "3. three\n4. four\n\n- [x] done\n- [ ] todo\n");
    }

    #[test]
    fn test_huge_list_start_saturates() {
        let markdown = render(json!({
            "type": "doc",
            "content": [
                {"type": "orderedList", "attrs": {"start": u64::MAX}, "content": [
                    {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "a"}]}]},
                    {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "b"}]}]}
                ]}
            ]
        }));

        assert_eq!(markdown, format!("{0}. a\n{0}. b\n", u64::MAX));
    }

    #[test]
    fn test_nested_list_is_indented() {
        let markdown = render(json!({
            "type": "doc",
            "content": [
                {"type": "bulletList", "content": [
                    {"type": "listItem", "content": [
                        {"type": "paragraph", "content": [{"type": "text", "text": "parent"}]},
                        {"type": "bulletList", "content": [
                            {"type": "listItem", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "child"}]}]}
                        ]}
                    ]}
                ]}
            ]
        }));

        assert_eq!(markdown, "- parent\n  - child\n");
    }

    #[test]
    fn test_empty_doc_renders_nothing() {
        assert_eq!(render_markdown(&ContentNode::doc(vec![])), "");
    }
}

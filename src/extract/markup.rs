use std::fmt;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input",
    "link", "meta", "param", "source", "track", "wbr",
];

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|v| !v.is_empty())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }
}

/// Predicate over a single element, renderable as a CSS-like selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    /// `.price-value`
    Class(String),
    /// `#total-fare`
    Id(String),
    /// `[data-price]`
    AttrPresent(String),
    /// `[data-testid*="price"]`
    AttrContains(String, String),
    /// `div[class]`, tag plus first attribute name
    TagWithAttr(String, String),
}

impl NodeTest {
    pub fn matches(&self, el: &Element) -> bool {
        match self {
            NodeTest::Class(cls) => el.classes().any(|c| c == cls.as_str()),
            NodeTest::Id(id) => el.id() == Some(id.as_str()),
            NodeTest::AttrPresent(name) => el.attr(name).is_some(),
            NodeTest::AttrContains(name, needle) => el
                .attr(name)
                .is_some_and(|v| v.to_lowercase().contains(&needle.to_lowercase())),
            NodeTest::TagWithAttr(tag, attr) => el.tag == *tag && el.attr(attr).is_some(),
        }
    }

    /// Inverse of `Display`; used when loading persisted rules.
    pub fn parse(s: &str) -> Option<NodeTest> {
        if let Some(cls) = s.strip_prefix('.') {
            return (!cls.is_empty()).then(|| NodeTest::Class(cls.to_string()));
        }
        if let Some(id) = s.strip_prefix('#') {
            return (!id.is_empty()).then(|| NodeTest::Id(id.to_string()));
        }
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            if let Some((name, rest)) = inner.split_once("*=") {
                let needle = rest.trim_matches('"');
                return Some(NodeTest::AttrContains(name.to_string(), needle.to_string()));
            }
            return (!inner.is_empty()).then(|| NodeTest::AttrPresent(inner.to_string()));
        }
        if let Some((tag, rest)) = s.split_once('[') {
            let attr = rest.strip_suffix(']')?;
            if !tag.is_empty() && !attr.is_empty() {
                return Some(NodeTest::TagWithAttr(tag.to_string(), attr.to_string()));
            }
        }
        None
    }
}

impl fmt::Display for NodeTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTest::Class(cls) => write!(f, ".{}", cls),
            NodeTest::Id(id) => write!(f, "#{}", id),
            NodeTest::AttrPresent(name) => write!(f, "[{}]", name),
            NodeTest::AttrContains(name, needle) => write!(f, "[{}*=\"{}\"]", name, needle),
            NodeTest::TagWithAttr(tag, attr) => write!(f, "{}[{}]", tag, attr),
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub element: Element,
    pub parent: Option<usize>,
    /// Byte span of the open tag, `<` through `>`.
    pub open_span: (usize, usize),
    /// Byte span of the content between open and close tag.
    pub inner_span: (usize, usize),
}

/// One captured body parsed into a flat node list, document order.
///
/// Tolerant by contract: arbitrary broken markup must produce *some* tree and
/// never an error. Unclosed tags extend to end of input, stray close tags are
/// ignored, script/style bodies are opaque text.
pub struct ParsedDoc<'a> {
    pub body: &'a str,
    pub nodes: Vec<Node>,
}

impl<'a> ParsedDoc<'a> {
    pub fn parse(body: &'a str) -> ParsedDoc<'a> {
        let bytes = body.as_bytes();
        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'<' {
                i += 1;
                continue;
            }

            let rest = &body[i..];
            if rest.starts_with("<!--") {
                i = rest[4..].find("-->").map(|p| i + 4 + p + 3).unwrap_or(bytes.len());
                continue;
            }
            if rest.starts_with("<!") || rest.starts_with("<?") {
                i = rest.find('>').map(|p| i + p + 1).unwrap_or(bytes.len());
                continue;
            }

            // ── Close tag ──
            if rest.starts_with("</") {
                let Some(gt) = rest.find('>') else { break };
                let name = rest[2..gt].trim().to_ascii_lowercase();
                if let Some(pos) = stack.iter().rposition(|&n| nodes[n].element.tag == name) {
                    for &n in &stack[pos..] {
                        nodes[n].inner_span.1 = i;
                    }
                    stack.truncate(pos);
                }
                i += gt + 1;
                continue;
            }

            // ── Open tag: must start with a letter ──
            if !bytes.get(i + 1).is_some_and(|b| b.is_ascii_alphabetic()) {
                i += 1;
                continue;
            }
            let Some(gt) = tag_end(body, i + 1) else { break };
            let raw = &body[i + 1..gt];
            let self_closing = raw.trim_end().ends_with('/');
            let element = parse_element(raw);
            let tag = element.tag.clone();
            let open_span = (i, gt + 1);
            let parent = stack.last().copied();

            if tag == "script" || tag == "style" {
                // Opaque content: consume through the matching close tag.
                let close = find_ci(body, gt + 1, &format!("</{}", tag));
                let (inner_end, next) = match close {
                    Some(p) => {
                        let after = body[p..].find('>').map(|q| p + q + 1).unwrap_or(bytes.len());
                        (p, after)
                    }
                    None => (bytes.len(), bytes.len()),
                };
                nodes.push(Node {
                    element,
                    parent,
                    open_span,
                    inner_span: (gt + 1, inner_end),
                });
                i = next;
            } else if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
                nodes.push(Node {
                    element,
                    parent,
                    open_span,
                    inner_span: (gt + 1, gt + 1),
                });
                i = gt + 1;
            } else {
                nodes.push(Node {
                    element,
                    parent,
                    open_span,
                    inner_span: (gt + 1, bytes.len()),
                });
                stack.push(nodes.len() - 1);
                i = gt + 1;
            }
        }

        ParsedDoc { body, nodes }
    }

    /// Indices of the enclosing element chain at `offset`, root first.
    /// Empty when the offset falls outside any element.
    pub fn chain_at(&self, offset: usize) -> Vec<usize> {
        let innermost = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.open_span.0 <= offset && offset < n.inner_span.1.max(n.open_span.1))
            .map(|(idx, _)| idx)
            .last();

        let mut chain = Vec::new();
        let mut cur = innermost;
        while let Some(idx) = cur {
            chain.push(idx);
            cur = self.nodes[idx].parent;
        }
        chain.reverse();
        chain
    }

    /// All node indices whose element satisfies `test`.
    pub fn matching(&self, test: &NodeTest) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| test.matches(&n.element))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Tag-stripped, whitespace-normalized text content of a node.
    pub fn inner_text(&self, idx: usize) -> String {
        let (start, end) = self.nodes[idx].inner_span;
        strip_tags(&self.body[start..end.min(self.body.len())])
    }
}

/// Find `>` closing the tag that starts at `from`, skipping quoted attribute
/// values (a `>` inside `alt="a > b"` does not end the tag).
fn tag_end(body: &str, from: usize) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    for (off, &b) in bytes[from..].iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => return Some(from + off),
                _ => {}
            },
        }
    }
    None
}

fn find_ci(body: &str, from: usize, needle: &str) -> Option<usize> {
    let lower = body.get(from..)?.to_ascii_lowercase();
    lower.find(&needle.to_ascii_lowercase()).map(|p| from + p)
}

/// Parse the inside of an open tag (`div class="a b" data-price`) into tag
/// name plus attribute pairs. Names lowercased, valueless attributes keep "".
fn parse_element(raw: &str) -> Element {
    let raw = raw.trim().trim_end_matches('/').trim_end();
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let tag = raw[..i].to_ascii_lowercase();
    let mut attrs = Vec::new();

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
            i += 1;
        }
        if i == name_start {
            break;
        }
        let name = raw[name_start..i].to_ascii_lowercase();

        let mut value = String::new();
        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let q = bytes[i];
                i += 1;
                let val_start = i;
                while i < bytes.len() && bytes[i] != q {
                    i += 1;
                }
                value = raw[val_start..i].to_string();
                i = (i + 1).min(bytes.len());
            } else {
                let val_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                value = raw[val_start..i].to_string();
            }
        }
        attrs.push((name, value));
    }

    Element { tag, attrs }
}

/// Remove tags and collapse whitespace runs to single spaces.
pub fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for ch in s.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_nesting() {
        let doc = ParsedDoc::parse("<div><span class=\"price-value\">£123</span></div>");
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[1].element.tag, "span");
        assert_eq!(doc.nodes[1].parent, Some(0));
    }

    #[test]
    fn chain_at_text_offset() {
        let body = "<div id=\"card\"><span class=\"price-value\">£123</span></div>";
        let doc = ParsedDoc::parse(body);
        let offset = body.find("123").unwrap();
        let chain = doc.chain_at(offset);
        assert_eq!(chain.len(), 2);
        assert_eq!(doc.nodes[chain[1]].element.tag, "span");
        assert_eq!(doc.nodes[chain[0]].element.id(), Some("card"));
    }

    #[test]
    fn chain_at_attribute_offset() {
        let body = "<meta content=\"599\"><p>x</p>";
        let doc = ParsedDoc::parse(body);
        let offset = body.find("599").unwrap();
        let chain = doc.chain_at(offset);
        assert_eq!(chain.len(), 1);
        assert_eq!(doc.nodes[chain[0]].element.tag, "meta");
    }

    #[test]
    fn void_elements_do_not_nest() {
        let doc = ParsedDoc::parse("<div><br><img src=\"x.png\"><p>text</p></div>");
        let p = doc.nodes.iter().find(|n| n.element.tag == "p").unwrap();
        assert_eq!(doc.nodes[p.parent.unwrap()].element.tag, "div");
    }

    #[test]
    fn script_body_is_opaque() {
        let body = "<div><script>var x = \"<p>not a tag</p>\";</script><b>y</b></div>";
        let doc = ParsedDoc::parse(body);
        assert!(doc.nodes.iter().all(|n| n.element.tag != "p"));
        let b = doc.nodes.iter().find(|n| n.element.tag == "b").unwrap();
        assert_eq!(doc.nodes[b.parent.unwrap()].element.tag, "div");
    }

    #[test]
    fn unclosed_tags_extend_to_eof() {
        let body = "<div><span>abc";
        let doc = ParsedDoc::parse(body);
        assert_eq!(doc.nodes[1].inner_span.1, body.len());
        let chain = doc.chain_at(body.find("abc").unwrap());
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn stray_close_ignored() {
        let doc = ParsedDoc::parse("</div><p>ok</p>");
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.inner_text(0), "ok");
    }

    #[test]
    fn gt_inside_quoted_attr() {
        let doc = ParsedDoc::parse("<img alt=\"a > b\" class=\"hero\"><p>t</p>");
        assert_eq!(doc.nodes[0].element.attr("alt"), Some("a > b"));
        assert_eq!(doc.nodes[1].element.tag, "p");
    }

    #[test]
    fn valueless_and_unquoted_attrs() {
        let doc = ParsedDoc::parse("<div data-price class=card>x</div>");
        let el = &doc.nodes[0].element;
        assert_eq!(el.attr("data-price"), Some(""));
        assert_eq!(el.attr("class"), Some("card"));
    }

    #[test]
    fn node_test_matching() {
        let doc = ParsedDoc::parse(
            "<div class=\"fare-price big\"><i data-testid=\"price-total\">£9</i></div>",
        );
        assert_eq!(doc.matching(&NodeTest::Class("fare-price".into())).len(), 1);
        assert_eq!(
            doc.matching(&NodeTest::AttrContains("data-testid".into(), "price".into())).len(),
            1
        );
        assert!(doc.matching(&NodeTest::Id("missing".into())).is_empty());
    }

    #[test]
    fn node_test_render_parse_inverse() {
        let tests = [
            NodeTest::Class("price-value".into()),
            NodeTest::Id("total".into()),
            NodeTest::AttrPresent("data-fare".into()),
            NodeTest::AttrContains("data-testid".into(), "price".into()),
            NodeTest::TagWithAttr("div".into(), "class".into()),
        ];
        for t in tests {
            assert_eq!(NodeTest::parse(&t.to_string()), Some(t));
        }
    }

    #[test]
    fn inner_text_strips_nested_tags() {
        let doc = ParsedDoc::parse("<div>from  <b>£42</b>\n return</div>");
        assert_eq!(doc.inner_text(0), "from £42 return");
    }

    #[test]
    fn garbage_never_panics() {
        for junk in ["<", "<<<>>>", "<div", "<a b=\"", "</", "<!--", "text < 5 > 3"] {
            let _ = ParsedDoc::parse(junk);
        }
    }
}

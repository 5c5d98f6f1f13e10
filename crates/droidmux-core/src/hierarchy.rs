//! UI hierarchy ("page source") parsing.
//!
//! `uiautomator dump` produces an XML document rooted at `<hierarchy>` whose
//! nested `<node>` elements describe the view tree:
//!
//! ```xml
//! <hierarchy rotation="0">
//!   <node index="0" class="android.widget.FrameLayout" package="com.example"
//!         resource-id="" content-desc="" text="" bounds="[0,0][1080,2400]">
//!     <node index="0" class="android.widget.Button" text="Sign in"
//!           resource-id="com.example:id/login" bounds="[40,900][1040,1020]"/>
//!   </node>
//! </hierarchy>
//! ```
//!
//! [`PageSource::parse`] turns that into an arena: nodes live in one `Vec`
//! in document order, children are referenced by [`NodeId`] and every node
//! keeps its parent's id.

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;

const ROOT_TAG: &str = "hierarchy";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("document has no <hierarchy> root")]
    MissingRoot,

    #[error("unexpected root element <{0}>")]
    UnexpectedRoot(String),

    #[error("invalid bounds {0:?}")]
    InvalidBounds(String),

    #[error("invalid value {value:?} for attribute {attribute}")]
    InvalidNumber { attribute: String, value: String },
}

impl From<quick_xml::Error> for ParseError {
    fn from(err: quick_xml::Error) -> Self {
        ParseError::Xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ParseError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        ParseError::Xml(err.to_string())
    }
}

/// Index of a node inside its [`PageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Screen rectangle in pixels. `left <= right` and `top <= bottom`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Parse uiautomator's `[left,top][right,bottom]` form.
    pub fn parse(bounds: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidBounds(bounds.to_string());

        let inner = bounds
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(invalid)?;
        let (first, second) = inner.split_once("][").ok_or_else(invalid)?;

        let point = |s: &str| -> Result<(i32, i32), ParseError> {
            let (x, y) = s.split_once(',').ok_or_else(invalid)?;
            let x = x.trim().parse().map_err(|_| invalid())?;
            let y = y.trim().parse().map_err(|_| invalid())?;
            Ok((x, y))
        };
        let (left, top) = point(first)?;
        let (right, bottom) = point(second)?;

        if left > right || top > bottom {
            return Err(invalid());
        }
        // Width and height must themselves fit in an i32.
        if right.checked_sub(left).is_none() || bottom.checked_sub(top).is_none() {
            return Err(invalid());
        }
        Ok(Self::new(left, top, right, bottom))
    }

    pub fn width(&self) -> i32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> i32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn center(&self) -> (i32, i32) {
        let mid = |lo: i32, hi: i32| ((i64::from(lo) + i64::from(hi)) / 2) as i32;
        (mid(self.left, self.right), mid(self.top, self.bottom))
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// One element of the view tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSourceNode {
    pub id: NodeId,
    /// XML tag name (`node` for views, `hierarchy` for the root).
    pub tag: String,
    pub index: u32,
    pub class_name: String,
    pub package_name: String,
    pub resource_id: String,
    pub content_description: String,
    pub text: String,
    pub bounds: Rect,
    /// Remaining attributes (`clickable`, `enabled`, `checked`, ...).
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    /// Distance from the root (the root is 0).
    pub depth: usize,
}

impl PageSourceNode {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Whether a boolean attribute such as `clickable` is `"true"`.
    pub fn flag(&self, name: &str) -> bool {
        self.attribute(name) == Some("true")
    }

    /// The most descriptive label available: text, then content
    /// description, then resource id.
    pub fn label(&self) -> Option<&str> {
        [&self.text, &self.content_description, &self.resource_id]
            .into_iter()
            .map(|s| s.as_str())
            .find(|s| !s.is_empty())
    }
}

/// A parsed UI hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSource {
    pub rotation: u32,
    pub width: i32,
    pub height: i32,
    nodes: Vec<PageSourceNode>,
}

impl PageSource {
    /// Parse a `uiautomator dump` document.
    pub fn parse(xml: &str) -> Result<Self, ParseError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut source: Option<PageSource> = None;
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let id = open_element(&mut source, &stack, &e)?;
                    stack.push(id);
                }
                Event::Empty(e) => {
                    open_element(&mut source, &stack, &e)?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(ParseError::Xml("unexpected end of document".to_string()));
        }
        source.ok_or(ParseError::MissingRoot)
    }

    pub fn root(&self) -> &PageSourceNode {
        &self.nodes[NodeId::ROOT.0]
    }

    pub fn node(&self, id: NodeId) -> Option<&PageSourceNode> {
        self.nodes.get(id.0)
    }

    pub fn parent(&self, id: NodeId) -> Option<&PageSourceNode> {
        self.node(id)?.parent.and_then(|p| self.node(p))
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &PageSourceNode> + '_ {
        self.node(id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |c| self.node(*c))
    }

    /// Walk from `id`'s parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = &PageSourceNode> + '_ {
        std::iter::successors(self.parent(id), move |n| self.parent(n.id))
    }

    /// All nodes in document (depth-first) order, root first.
    pub fn iter(&self) -> impl Iterator<Item = &PageSourceNode> + '_ {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a parsed page has at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The deepest node whose bounds contain the point.
    pub fn node_at(&self, x: i32, y: i32) -> Option<&PageSourceNode> {
        self.nodes
            .iter()
            .skip(1)
            .filter(|n| n.bounds.contains(x, y))
            .max_by_key(|n| n.depth)
    }
}

fn open_element(
    source: &mut Option<PageSource>,
    stack: &[NodeId],
    element: &BytesStart<'_>,
) -> Result<NodeId, ParseError> {
    let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut attributes = BTreeMap::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attributes.insert(key, value);
    }

    let Some(page) = source.as_mut() else {
        if tag != ROOT_TAG {
            return Err(ParseError::UnexpectedRoot(tag));
        }
        let rotation = number(&mut attributes, "rotation")?;
        let width: i32 = number(&mut attributes, "width")?;
        let height: i32 = number(&mut attributes, "height")?;
        let root = PageSourceNode {
            id: NodeId::ROOT,
            tag,
            index: 0,
            class_name: String::new(),
            package_name: String::new(),
            resource_id: String::new(),
            content_description: String::new(),
            text: String::new(),
            bounds: Rect::new(0, 0, width.max(0), height.max(0)),
            attributes,
            children: Vec::new(),
            parent: None,
            depth: 0,
        };
        *source = Some(PageSource {
            rotation,
            width,
            height,
            nodes: vec![root],
        });
        return Ok(NodeId::ROOT);
    };

    let Some(&parent) = stack.last() else {
        return Err(ParseError::Xml(format!("second top-level element <{tag}>")));
    };

    let bounds = match attributes.remove("bounds") {
        Some(b) => Rect::parse(&b)?,
        None => Rect::default(),
    };
    let id = NodeId(page.nodes.len());
    let depth = page.nodes[parent.0].depth + 1;
    let node = PageSourceNode {
        id,
        tag,
        index: number(&mut attributes, "index")?,
        class_name: attributes.remove("class").unwrap_or_default(),
        package_name: attributes.remove("package").unwrap_or_default(),
        resource_id: attributes.remove("resource-id").unwrap_or_default(),
        content_description: attributes.remove("content-desc").unwrap_or_default(),
        text: attributes.remove("text").unwrap_or_default(),
        bounds,
        attributes,
        children: Vec::new(),
        parent: Some(parent),
        depth,
    };
    page.nodes.push(node);
    page.nodes[parent.0].children.push(id);
    Ok(id)
}

/// Remove a numeric attribute, defaulting to zero when absent.
fn number<T>(attributes: &mut BTreeMap<String, String>, name: &str) -> Result<T, ParseError>
where
    T: std::str::FromStr + Default,
{
    match attributes.remove(name) {
        None => Ok(T::default()),
        Some(value) => value.trim().parse().map_err(|_| ParseError::InvalidNumber {
            attribute: name.to_string(),
            value,
        }),
    }
}

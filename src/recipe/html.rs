use allocative::{Allocative, Visitor};
use anyhow::Context as _;
use ego_tree::NodeId;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use starlark::any::ProvidesStaticType;
use starlark::environment::{Methods, MethodsBuilder, MethodsStatic};
use starlark::values::{AllocValue, Heap, StarlarkValue, Value, ValueLike, starlark_value};
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex};

/// A parsed HTML document exposed to recipes. Selections support `find`,
/// `text`, `attr` and `each`.
#[derive(Debug, ProvidesStaticType, Clone)]
pub struct HtmlDocument {
    pub doc: Arc<Mutex<Html>>,
}

impl HtmlDocument {
    pub fn parse(data: &str) -> Self {
        Self {
            doc: Arc::new(Mutex::new(Html::parse_document(data))),
        }
    }
}

impl Serialize for HtmlDocument {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("HtmlDocument")
    }
}

impl Display for HtmlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HtmlDocument")
    }
}

impl Allocative for HtmlDocument {
    fn visit<'a, 'b: 'a>(&self, visitor: &'a mut Visitor<'b>) {
        let visitor = visitor.enter_self_sized::<Self>();
        visitor.exit();
    }
}

#[starlark_value(type = "HtmlDocument")]
impl<'v> StarlarkValue<'v> for HtmlDocument {
    fn get_methods() -> Option<&'static Methods> {
        static RES: MethodsStatic = MethodsStatic::new();
        RES.methods(html_document_methods)
    }
}

impl<'v> AllocValue<'v> for HtmlDocument {
    fn alloc_value(self, heap: &'v Heap) -> Value<'v> {
        heap.alloc_simple(self)
    }
}

#[starlark::starlark_module]
fn html_document_methods(builder: &mut MethodsBuilder) {
    fn find<'v>(this: Value<'v>, selector: String, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let this = this
            .downcast_ref::<HtmlDocument>()
            .context("not an HtmlDocument")?;
        let selector = parse_selector(&selector)?;
        let guard = this.doc.lock().unwrap();
        let nodes: Vec<_> = guard
            .select(&selector)
            .map(|el| HtmlNode {
                doc: this.doc.clone(),
                node_id: el.id(),
            })
            .collect();
        Ok(heap.alloc(nodes))
    }

    fn text(this: Value) -> anyhow::Result<String> {
        let this = this
            .downcast_ref::<HtmlDocument>()
            .context("not an HtmlDocument")?;
        let guard = this.doc.lock().unwrap();
        Ok(guard.root_element().text().collect::<Vec<_>>().join(""))
    }

    fn attr<'v>(this: Value<'v>, name: String, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let this = this
            .downcast_ref::<HtmlDocument>()
            .context("not an HtmlDocument")?;
        let guard = this.doc.lock().unwrap();
        match guard.root_element().value().attr(&name) {
            Some(v) => Ok(heap.alloc(v.to_string())),
            None => Ok(Value::new_none()),
        }
    }

    fn each<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let this = this
            .downcast_ref::<HtmlDocument>()
            .context("not an HtmlDocument")?;
        let guard = this.doc.lock().unwrap();
        let root = guard.root_element();
        Ok(heap.alloc(element_children(&this.doc, root)))
    }
}

/// One element inside an [`HtmlDocument`].
#[derive(Debug, ProvidesStaticType, Clone)]
pub struct HtmlNode {
    pub doc: Arc<Mutex<Html>>,
    pub node_id: NodeId,
}

impl Serialize for HtmlNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let guard = self.doc.lock().unwrap();
        if let Some(node) = guard.tree.get(self.node_id) {
            if let Some(element) = ElementRef::wrap(node) {
                return serializer.serialize_str(&element.html());
            }
        }
        serializer.serialize_none()
    }
}

impl Allocative for HtmlNode {
    fn visit<'a, 'b: 'a>(&self, visitor: &'a mut Visitor<'b>) {
        let visitor = visitor.enter_self_sized::<Self>();
        visitor.exit();
    }
}

impl Display for HtmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.doc.lock().unwrap();
        if let Some(node) = guard.tree.get(self.node_id) {
            if let Some(element) = ElementRef::wrap(node) {
                return write!(f, "<{} ...>", element.value().name());
            }
        }
        write!(f, "<unknown>")
    }
}

#[starlark_value(type = "HtmlNode")]
impl<'v> StarlarkValue<'v> for HtmlNode {
    fn get_methods() -> Option<&'static Methods> {
        static RES: MethodsStatic = MethodsStatic::new();
        RES.methods(html_node_methods)
    }
}

impl<'v> AllocValue<'v> for HtmlNode {
    fn alloc_value(self, heap: &'v Heap) -> Value<'v> {
        heap.alloc_simple(self)
    }
}

#[starlark::starlark_module]
fn html_node_methods(builder: &mut MethodsBuilder) {
    fn find<'v>(this: Value<'v>, selector: String, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let this = this.downcast_ref::<HtmlNode>().context("not an HtmlNode")?;
        let selector = parse_selector(&selector)?;
        let guard = this.doc.lock().unwrap();
        let node = guard.tree.get(this.node_id).context("node not found")?;
        let element = ElementRef::wrap(node).context("not an element")?;
        let nodes: Vec<_> = element
            .select(&selector)
            .map(|el| HtmlNode {
                doc: this.doc.clone(),
                node_id: el.id(),
            })
            .collect();
        Ok(heap.alloc(nodes))
    }

    fn text(this: Value) -> anyhow::Result<String> {
        let this = this.downcast_ref::<HtmlNode>().context("not an HtmlNode")?;
        let guard = this.doc.lock().unwrap();
        let node = guard.tree.get(this.node_id).context("node not found")?;
        let element = ElementRef::wrap(node).context("not an element")?;
        Ok(element.text().collect::<Vec<_>>().join(""))
    }

    fn attr<'v>(this: Value<'v>, name: String, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let this = this.downcast_ref::<HtmlNode>().context("not an HtmlNode")?;
        let guard = this.doc.lock().unwrap();
        let node = guard.tree.get(this.node_id).context("node not found")?;
        let element = ElementRef::wrap(node).context("not an element")?;
        match element.value().attr(&name) {
            Some(v) => Ok(heap.alloc(v.to_string())),
            None => Ok(Value::new_none()),
        }
    }

    fn each<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
        let this = this.downcast_ref::<HtmlNode>().context("not an HtmlNode")?;
        let guard = this.doc.lock().unwrap();
        let node = guard.tree.get(this.node_id).context("node not found")?;
        let element = ElementRef::wrap(node).context("not an element")?;
        Ok(heap.alloc(element_children(&this.doc, element)))
    }
}

fn parse_selector(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| anyhow::anyhow!("CSS selector parse error: {:?}", e))
}

fn element_children(doc: &Arc<Mutex<Html>>, element: ElementRef<'_>) -> Vec<HtmlNode> {
    element
        .children()
        .filter_map(ElementRef::wrap)
        .map(|el| HtmlNode {
            doc: doc.clone(),
            node_id: el.id(),
        })
        .collect()
}

/// Converts HTML into a `{tag, attr{}, children[], text}` tree. `text` is
/// the element's direct text content; nested elements appear in `children`.
pub fn to_json_tree(data: &str) -> serde_json::Value {
    let html = Html::parse_document(data);
    element_to_json(html.root_element())
}

fn element_to_json(element: ElementRef<'_>) -> serde_json::Value {
    let mut attr = serde_json::Map::new();
    for (name, value) in element.value().attrs() {
        attr.insert(name.to_string(), serde_json::Value::String(value.to_string()));
    }

    let children: Vec<_> = element
        .children()
        .filter_map(ElementRef::wrap)
        .map(element_to_json)
        .collect();

    let text: String = element
        .children()
        .filter_map(|n| n.value().as_text().map(|t| t.to_string()))
        .collect();

    serde_json::json!({
        "tag": element.value().name(),
        "attr": serde_json::Value::Object(attr),
        "children": children,
        "text": text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json_tree() {
        let tree = to_json_tree(r#"<html><body><a href="/x">link</a>tail</body></html>"#);
        assert_eq!(tree["tag"], "html");
        let body = &tree["children"][0];
        assert_eq!(body["tag"], "body");
        assert_eq!(body["text"], "tail");
        let a = &body["children"][0];
        assert_eq!(a["tag"], "a");
        assert_eq!(a["attr"]["href"], "/x");
        assert_eq!(a["text"], "link");
    }
}

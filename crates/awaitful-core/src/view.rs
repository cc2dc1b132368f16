//! Render trees.
//!
//! An [`Element`] is what a component's render function returns. Attribute
//! values and children may be deferred async functions; each deferred part
//! is mounted with its own render loop, so a change it depends on re-renders
//! only that part.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::component::Component;
use crate::context::Context;
use crate::error::Result;
use crate::host::Event;

/// Async attribute value.
pub type DeferredText = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Async list of children.
pub type DeferredChildren =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Vec<Child>>> + Send + Sync>;

/// Event handler. Runs with a frozen listener context.
pub type Listener = Arc<dyn Fn(Context, Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub enum Attr {
    Literal(String),
    Deferred(DeferredText),
    Listener(Listener),
}

pub enum Child {
    Text(String),
    Element(Element),
    Deferred(DeferredChildren),
    Component {
        component: Arc<dyn Component>,
        attributes: Vec<(String, String)>,
    },
}

impl From<Element> for Child {
    fn from(element: Element) -> Self {
        Child::Element(element)
    }
}

impl From<String> for Child {
    fn from(text: String) -> Self {
        Child::Text(text)
    }
}

impl From<&str> for Child {
    fn from(text: &str) -> Self {
        Child::Text(text.to_string())
    }
}

pub struct Element {
    pub tag: String,
    pub attributes: Vec<(String, Attr)>,
    pub children: Vec<Child>,
}

/// Start an element.
pub fn h(tag: impl Into<String>) -> Element {
    Element {
        tag: tag.into(),
        attributes: Vec::new(),
        children: Vec::new(),
    }
}

impl Element {
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .push((name.into(), Attr::Literal(value.into())));
        self
    }

    /// Attribute whose value is rendered by its own loop.
    pub fn attr_with<F, Fut>(mut self, name: impl Into<String>, render: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let render: DeferredText = Arc::new(move |ctx| render(ctx).boxed());
        self.attributes.push((name.into(), Attr::Deferred(render)));
        self
    }

    /// Listen for `event` on this element.
    pub fn on<F, Fut>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Listener = Arc::new(move |ctx, event| handler(ctx, event).boxed());
        self.attributes.push((event.into(), Attr::Listener(handler)));
        self
    }

    pub fn child(mut self, child: impl Into<Child>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn children<I, C>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Child>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Child::Text(text.into()));
        self
    }

    /// Children rendered by their own loop.
    pub fn child_with<F, Fut>(mut self, render: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Child>>> + Send + 'static,
    {
        let render: DeferredChildren = Arc::new(move |ctx| render(ctx).boxed());
        self.children.push(Child::Deferred(render));
        self
    }

    /// Nested component instance with literal attributes.
    pub fn component<C: Component>(mut self, component: C, attributes: &[(&str, &str)]) -> Self {
        self.children.push(Child::Component {
            component: Arc::new(component),
            attributes: attributes
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_parts() {
        let element = h("ul")
            .attr("class", "items")
            .attr_with("title", |_ctx| async { Ok("t".to_string()) })
            .on("click", |_ctx, _event| async { Ok(()) })
            .text("head")
            .child(h("li").text("a"))
            .child_with(|_ctx| async { Ok(vec![Child::from("b")]) });

        assert_eq!(element.tag, "ul");
        assert_eq!(element.attributes.len(), 3);
        assert!(matches!(element.attributes[0].1, Attr::Literal(ref v) if v == "items"));
        assert!(matches!(element.attributes[1].1, Attr::Deferred(_)));
        assert!(matches!(element.attributes[2].1, Attr::Listener(_)));
        assert_eq!(element.children.len(), 3);
        assert!(matches!(element.children[1], Child::Element(ref li) if li.tag == "li"));
        assert!(matches!(element.children[2], Child::Deferred(_)));
    }
}

//! Component instances.
//!
//! Mounting a component creates its host node, its key tables and a root
//! scope, then runs its render function in a render loop. Every pass output
//! replaces the node's children. Deferred attributes and children inside the
//! output get loops of their own under a scope that is aborted as soon as the
//! enclosing output is replaced.

use std::sync::Arc;

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::error::Result;
use crate::host::{Event, Host, HostListener, NodeId};
use crate::runtime::Runtime;
use crate::scheduler::{LoopHandle, RenderLoop};
use crate::scope::Scope;
use crate::view::{Attr, Child, Element, Listener};

/// A renderable component type.
pub trait Component: Send + Sync + 'static {
    /// Tag of the component's host node.
    fn name(&self) -> &str;

    /// Attributes mirrored into `prop` cells.
    fn observed_attributes(&self) -> &[&str] {
        &[]
    }

    fn render(&self, ctx: Context) -> BoxFuture<'static, Result<Element>>;
}

/// Mount `component` as a new instance with its own root scope.
pub fn mount_component(
    runtime: &Runtime,
    host: Arc<dyn Host>,
    component: Arc<dyn Component>,
    attributes: &[(&str, &str)],
) -> Result<ComponentHandle> {
    mount(runtime, host, component, attributes, Scope::new())
}

/// Mount `component` as a new instance living under `scope`.
pub fn mount(
    runtime: &Runtime,
    host: Arc<dyn Host>,
    component: Arc<dyn Component>,
    attributes: &[(&str, &str)],
    scope: Scope,
) -> Result<ComponentHandle> {
    let node = host.create_element(component.name())?;
    let ctx = runtime.context_in(scope);
    let observed: Vec<String> = component
        .observed_attributes()
        .iter()
        .map(|name| name.to_string())
        .collect();

    for (name, value) in attributes {
        host.set_attribute(node, name, value)?;
        if observed.iter().any(|o| o == name) {
            ctx.set_prop(name, *value)?;
        }
    }

    let label = component.name().to_string();
    let mut region = Region::new(host.clone(), node, label.clone());
    let task = RenderLoop::new(&label, &ctx).spawn(
        move |pass: Context| {
            let component = component.clone();
            async move {
                let element = component.render(pass.clone()).await?;
                Ok((vec![Child::Element(element)], pass))
            }
        },
        move |(children, pass): (Vec<Child>, Context)| region.replace(children, &pass),
    );
    tracing::debug!(component = %label, %node, "mounted");

    Ok(ComponentHandle {
        ctx,
        host,
        node,
        observed,
        task,
    })
}

/// A mounted component instance.
pub struct ComponentHandle {
    ctx: Context,
    host: Arc<dyn Host>,
    node: NodeId,
    observed: Vec<String>,
    task: LoopHandle,
}

impl ComponentHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The instance context, outside any pass.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The instance's top-level loop.
    pub fn task(&self) -> &LoopHandle {
        &self.task
    }

    /// Attribute change on the host node. Observed attributes are pushed
    /// into their `prop` cell.
    pub fn set_attribute(&self, name: &str, value: &str) -> Result<()> {
        self.host.set_attribute(self.node, name, value)?;
        if self.observed.iter().any(|o| o == name) {
            self.ctx.set_prop(name, value)?;
        }
        Ok(())
    }

    /// Abort every loop of the instance and release its node.
    pub fn unmount(self) -> Result<()> {
        self.ctx.scope().abort();
        self.host.release(self.node)?;
        tracing::debug!(node = %self.node, "unmounted");
        Ok(())
    }
}

/// Host node whose children are owned by one render loop.
///
/// Nested component instances survive a replace when the new output names
/// them again under the same key; their attributes are updated in place.
struct Region {
    host: Arc<dyn Host>,
    node: NodeId,
    label: String,
    nested: Option<Scope>,
    nodes: Vec<NodeId>,
    instances: FxHashMap<String, ComponentHandle>,
}

impl Region {
    fn new(host: Arc<dyn Host>, node: NodeId, label: String) -> Self {
        Self {
            host,
            node,
            label,
            nested: None,
            nodes: Vec::new(),
            instances: FxHashMap::default(),
        }
    }

    fn replace(&mut self, children: Vec<Child>, pass: &Context) {
        if let Err(e) = self.try_replace(children, pass) {
            tracing::error!(label = %self.label, error = %e, "failed to mount output");
        }
    }

    fn try_replace(&mut self, children: Vec<Child>, pass: &Context) -> Result<()> {
        if let Some(previous) = self.nested.take() {
            previous.abort();
        }
        let scope = pass.scope().child();
        let mut builder = Builder {
            host: self.host.clone(),
            ctx: pass.with_scope(scope.clone()),
            pass: pass.clone(),
            label: self.label.clone(),
            owner: pass.scope().clone(),
            previous: std::mem::take(&mut self.instances),
            kept: FxHashMap::default(),
            seen: FxHashMap::default(),
        };
        self.nested = Some(scope);

        let mut nodes = Vec::new();
        for child in children {
            nodes.extend(builder.build(child)?);
        }
        self.host.replace_children(self.node, nodes.clone())?;

        for (key, stale) in builder.previous.drain() {
            tracing::trace!(label = %self.label, %key, "nested component dropped");
            stale.unmount()?;
        }
        self.instances = builder.kept;
        for old in std::mem::replace(&mut self.nodes, nodes) {
            if !self.nodes.contains(&old) {
                self.host.release(old)?;
            }
        }
        Ok(())
    }
}

/// Turns one pass output into host nodes.
struct Builder {
    host: Arc<dyn Host>,
    /// Context nested loops are spawned from.
    ctx: Context,
    /// Context of the pass that produced the output; listeners freeze it.
    pass: Context,
    label: String,
    /// Scope nested component instances live under.
    owner: Scope,
    /// Instances of the previous output not claimed yet.
    previous: FxHashMap<String, ComponentHandle>,
    /// Instances of this output.
    kept: FxHashMap<String, ComponentHandle>,
    /// Occurrences of each component name so far.
    seen: FxHashMap<String, usize>,
}

impl Builder {
    fn build(&mut self, child: Child) -> Result<Vec<NodeId>> {
        match child {
            Child::Text(text) => Ok(vec![self.host.create_text(&text)?]),
            Child::Element(element) => Ok(vec![self.element(element)?]),
            Child::Deferred(render) => {
                let slot = self.host.create_slot()?;
                let label = format!("{}/children", self.label);
                let mut region = Region::new(self.host.clone(), slot, label.clone());
                self.ctx.spawn_child(
                    &label,
                    move |pass: Context| {
                        let children = render(pass.clone());
                        async move { Ok((children.await?, pass)) }
                    },
                    move |(children, pass): (Vec<Child>, Context)| region.replace(children, &pass),
                );
                Ok(vec![slot])
            }
            Child::Component {
                component,
                attributes,
            } => {
                let key = self.instance_key(component.name(), &attributes);
                let handle = match self.previous.remove(&key) {
                    Some(handle) => {
                        for (name, value) in &attributes {
                            handle.set_attribute(name, value)?;
                        }
                        handle
                    }
                    None => {
                        let attributes: Vec<(&str, &str)> = attributes
                            .iter()
                            .map(|(name, value)| (name.as_str(), value.as_str()))
                            .collect();
                        mount(
                            self.ctx.runtime(),
                            self.host.clone(),
                            component,
                            &attributes,
                            self.owner.child(),
                        )?
                    }
                };
                let node = handle.node();
                self.kept.insert(key, handle);
                Ok(vec![node])
            }
        }
    }

    /// An explicit `key` attribute, else the component name and how many
    /// of that name came before it.
    fn instance_key(&mut self, name: &str, attributes: &[(String, String)]) -> String {
        if let Some((_, key)) = attributes.iter().find(|(attr, _)| attr == "key") {
            return format!("{name}:{key}");
        }
        let seen = self.seen.entry(name.to_string()).or_default();
        *seen += 1;
        format!("{name}#{seen}")
    }

    fn element(&mut self, element: Element) -> Result<NodeId> {
        let node = self.host.create_element(&element.tag)?;
        for (name, attr) in element.attributes {
            match attr {
                Attr::Literal(value) => self.host.set_attribute(node, &name, &value)?,
                Attr::Deferred(render) => {
                    let label = format!("{}/@{}", self.label, name);
                    let host = self.host.clone();
                    self.ctx.spawn_child(
                        &label,
                        move |pass| render(pass),
                        move |value: String| {
                            if let Err(e) = host.set_attribute(node, &name, &value) {
                                tracing::error!(%node, attribute = %name, error = %e, "failed to set attribute");
                            }
                        },
                    );
                }
                Attr::Listener(handler) => {
                    self.host
                        .add_listener(node, &name, self.listener(&name, handler))?;
                }
            }
        }
        for child in element.children {
            for id in self.build(child)? {
                self.host.append_child(node, id)?;
            }
        }
        Ok(node)
    }

    /// Wrap a handler so each call runs in a fresh frozen context.
    fn listener(&self, event: &str, handler: Listener) -> HostListener {
        let pass = self.pass.clone();
        let label = format!("{}/on{}", self.label, event);
        Arc::new(move |event: Event| {
            let ctx = match pass.listener() {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::error!(label = %label, error = %e, "listener context unavailable");
                    return;
                }
            };
            let running = handler(ctx, event);
            let label = label.clone();
            tokio::spawn(async move {
                if let Err(e) = running.await {
                    tracing::warn!(label = %label, error = %e, "listener failed");
                }
            });
        })
    }
}

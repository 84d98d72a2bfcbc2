//! Firmware side of the bridge: the executor that owns the DOM.
//!
//! All state is threaded through [`Firmware`] explicitly; there are no
//! ambient globals. `element-exec` resolves handlers from a closed
//! registry the embedder filled at construction time. Arbitrary source
//! only runs if the embedder installed the `unsafe-exec` capability.
//!
//! Messages are applied strictly in arrival order, which together with the
//! channel's FIFO guarantee gives per-descriptor orderedness: an insert
//! issued after a select acts on the element that select bound.

use std::collections::HashMap;

use super::message::{Message, RunLevels, Selector, SelectorKind};
use super::registry::{ModuleLoader, ModuleRegistry};
use super::BridgeError;
use crate::base64;

/// The DOM surface the firmware drives. An external collaborator; tests
/// use a fake, the real page wires this to the document.
pub trait Dom {
    type Element: Clone;

    fn by_id(&mut self, id: &str) -> Option<Self::Element>;
    fn by_class_name(&mut self, name: &str) -> Vec<Self::Element>;
    fn by_tag_name(&mut self, name: &str) -> Vec<Self::Element>;

    fn set_inner_html(&mut self, element: &Self::Element, html: &str);
    fn replace_outer_html(&mut self, element: &Self::Element, html: &str);
}

/// A registered exec handler: element plus JSON arguments in, JSON out.
pub type Handler<D> = Box<
    dyn FnMut(
        &mut D,
        &<D as Dom>::Element,
        &serde_json::Value,
    ) -> Result<serde_json::Value, String>,
>;

/// The escape hatch: runs raw source against an element. Only installed
/// deliberately.
pub type UnsafeExec<D> = Box<
    dyn FnMut(
        &mut D,
        &<D as Dom>::Element,
        &str,
        &serde_json::Value,
    ) -> Result<serde_json::Value, String>,
>;

/// Which command groups the kernel has enabled so far.
#[derive(Debug, Default, Clone, Copy)]
struct Enabled {
    boot: bool,
    filesystem: bool,
    create_proc: bool,
}

pub struct Firmware<D: Dom, L: ModuleLoader> {
    dom: D,
    loader: L,
    registry: ModuleRegistry<L::Module>,
    bound: HashMap<u64, D::Element>,
    handlers: HashMap<String, Handler<D>>,
    unsafe_exec: Option<UnsafeExec<D>>,
    enabled: Enabled,
    reaped: HashMap<u64, (i32, Option<String>, Option<String>)>,
}

impl<D: Dom, L: ModuleLoader> Firmware<D, L> {
    pub fn new(dom: D, loader: L) -> Self {
        Firmware {
            dom,
            loader,
            registry: ModuleRegistry::new(),
            bound: HashMap::new(),
            handlers: HashMap::new(),
            unsafe_exec: None,
            enabled: Enabled::default(),
            reaped: HashMap::new(),
        }
    }

    /// Register a named exec handler.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Handler<D>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Install the source-text escape hatch.
    pub fn enable_unsafe_exec(&mut self, exec: UnsafeExec<D>) {
        self.unsafe_exec = Some(exec);
    }

    pub fn dom(&mut self) -> &mut D {
        &mut self.dom
    }

    pub fn modules(&self) -> &ModuleRegistry<L::Module> {
        &self.registry
    }

    /// Result of a reaped process started from this side, if it arrived.
    pub fn take_reaped(&mut self, fid: u64) -> Option<(i32, Option<String>, Option<String>)> {
        self.reaped.remove(&fid)
    }

    pub fn is_bound(&self, ed: u64) -> bool {
        self.bound.contains_key(&ed)
    }

    /// Apply one inbound message; returns the responses to send back.
    pub fn handle(&mut self, message: Message) -> Vec<Message> {
        match message {
            Message::RunLevel(levels) => {
                self.apply_run_level(levels);
                Vec::new()
            }

            Message::ElementSelect { ed, selectors } => self.on_select(ed, selectors),

            Message::ElementInsert { ed, inner_html } => match self.bound.get(&ed) {
                Some(element) => {
                    let element = element.clone();
                    self.dom.set_inner_html(&element, &inner_html);
                    Vec::new()
                }
                None => fault(BridgeError::UnknownDescriptor(ed)),
            },

            Message::ElementReplace { ed, outer_html } => match self.bound.remove(&ed) {
                Some(element) => {
                    self.dom.replace_outer_html(&element, &outer_html);
                    Vec::new()
                }
                None => fault(BridgeError::UnknownDescriptor(ed)),
            },

            Message::ElementExec {
                ed,
                handler,
                source,
                args,
                ret_ed,
            } => self.on_exec(ed, handler, source, args, ret_ed),

            Message::Module {
                module,
                kind,
                options: _,
                ed,
            } => self.on_module(module, kind, ed),

            // A spawn request that originated here comes back around to the
            // kernel unchanged; the kernel owns processes.
            Message::CreateProc { .. } => vec![message],

            Message::Reap {
                fid,
                status,
                stdout,
                stderr,
            } => {
                self.reaped.insert(fid, (status, stdout, stderr));
                Vec::new()
            }

            Message::Error(_) | Message::Completed { .. } => Vec::new(),
        }
    }

    fn apply_run_level(&mut self, levels: RunLevels) {
        // Levels only ever ratchet upwards.
        if levels.boot.unwrap_or(0) > 0 {
            self.enabled.boot = true;
        }
        if levels.filesystem.unwrap_or(0) > 0 {
            self.enabled.filesystem = true;
        }
        if levels.create_proc.unwrap_or(0) > 0 {
            self.enabled.create_proc = true;
        }
    }

    fn on_select(&mut self, ed: u64, selectors: Vec<Selector>) -> Vec<Message> {
        if !self.enabled.boot {
            return completed_error(ed, "element commands not enabled yet");
        }

        for selector in &selectors {
            let kind = match selector.kind() {
                Ok(kind) => kind,
                Err(err) => return completed_error(ed, &err.to_string()),
            };

            let element = match kind {
                SelectorKind::ById(id) => self.dom.by_id(id),
                SelectorKind::ByClassName { name, .. } => {
                    self.dom.by_class_name(name).into_iter().next()
                }
                SelectorKind::ByTagName { name, .. } => {
                    self.dom.by_tag_name(name).into_iter().next()
                }
            };

            if let Some(element) = element {
                self.bound.insert(ed, element);
                return vec![Message::Completed {
                    ed,
                    result: None,
                    error: None,
                }];
            }
        }

        completed_error(ed, "no selector matched")
    }

    fn on_exec(
        &mut self,
        ed: u64,
        handler: Option<String>,
        source: Option<String>,
        args: serde_json::Value,
        ret_ed: Option<u64>,
    ) -> Vec<Message> {
        let Some(element) = self.bound.get(&ed).cloned() else {
            return fault(BridgeError::UnknownDescriptor(ed));
        };

        let result = match (handler, source) {
            (Some(name), _) => match self.handlers.get_mut(&name) {
                Some(run) => run(&mut self.dom, &element, &args),
                None => Err(BridgeError::UnknownHandler(name).to_string()),
            },
            (None, Some(text)) => match self.unsafe_exec.as_mut() {
                Some(exec) => exec(&mut self.dom, &element, &text, &args),
                None => Err(BridgeError::UnsafeExecDisabled.to_string()),
            },
            (None, None) => Err("exec names neither a handler nor source".to_owned()),
        };

        match (ret_ed, result) {
            (Some(ret), Ok(value)) => vec![Message::Completed {
                ed: ret,
                result: Some(value),
                error: None,
            }],
            (Some(ret), Err(reason)) => completed_error(ret, &reason),
            (None, Ok(_)) => Vec::new(),
            (None, Err(reason)) => vec![Message::Error(serde_json::json!({
                "ed": ed,
                "exec": reason,
            }))],
        }
    }

    fn on_module(&mut self, body: String, kind: Option<String>, ed: u64) -> Vec<Message> {
        if !self.enabled.boot {
            return completed_error(ed, "module loading not enabled yet");
        }

        let bytes = match kind.as_deref() {
            Some("base64") => base64::decode(base64::trim_mangled(body.as_bytes())),
            _ => body.into_bytes(),
        };

        match self.registry.load_bytes(&mut self.loader, &bytes) {
            Ok(key) => vec![Message::Completed {
                ed,
                result: Some(serde_json::json!(key.to_hex())),
                error: None,
            }],
            Err(err) => completed_error(ed, &err.to_string()),
        }
    }
}

fn completed_error(ed: u64, reason: &str) -> Vec<Message> {
    vec![Message::Completed {
        ed,
        result: None,
        error: Some(reason.to_owned()),
    }]
}

fn fault(err: BridgeError) -> Vec<Message> {
    vec![Message::Error(serde_json::json!({
        "fault": err.to_string(),
    }))]
}

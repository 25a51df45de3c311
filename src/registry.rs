//! Listener and handler registry
//!
//! An explicit mapping from string keys to constructors, built at the
//! composition root. Components receive their dependencies through options
//! structs and never look themselves up, so they stay constructible in
//! isolation.

use crate::handler::{Handler, HandlerOptions, RedirectHandler};
use crate::listener::{Http2Listener, Listener, ListenerOptions};
use std::collections::HashMap;

pub type ListenerCtor = fn(ListenerOptions) -> Box<dyn Listener>;
pub type HandlerCtor = fn(HandlerOptions) -> Box<dyn Handler>;

#[derive(Default)]
pub struct Registry {
    listeners: HashMap<&'static str, ListenerCtor>,
    handlers: HashMap<&'static str, HandlerCtor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_listener("http2", |options| Box::new(Http2Listener::new(options)));
        registry.register_handler("redu", |options| Box::new(RedirectHandler::new(options)));
        registry
    }

    pub fn register_listener(&mut self, key: &'static str, ctor: ListenerCtor) {
        self.listeners.insert(key, ctor);
    }

    pub fn register_handler(&mut self, key: &'static str, ctor: HandlerCtor) {
        self.handlers.insert(key, ctor);
    }

    pub fn listener(&self, key: &str) -> Option<ListenerCtor> {
        self.listeners.get(key).copied()
    }

    pub fn handler(&self, key: &str) -> Option<HandlerCtor> {
        self.handlers.get(key).copied()
    }
}

//! Optional capabilities offered to applications.
//!
//! An application checks `scope.extensions()` before relying on an
//! extension; a missing extension is never an error.

use std::collections::BTreeSet;

use anyhow::bail;

use crate::config::ServerConfig;
use crate::gateway::scope::ScopeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Extension {
    /// `http.fullflush`: write any held-back response bytes immediately.
    FullFlush,
    /// Negotiated TLS parameters in `scope.tls`.
    Tls,
    /// Application-handled ping/pong via `websocket.auto_pong`.
    WebSocketPing,
}

impl Extension {
    pub const ALL: [Extension; 3] =
        [Extension::FullFlush, Extension::Tls, Extension::WebSocketPing];

    pub fn name(&self) -> &'static str {
        match self {
            Extension::FullFlush => "fullflush",
            Extension::Tls => "tls",
            Extension::WebSocketPing => "websocket.ping",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ext| ext.name() == name)
    }

    fn applies_to(&self, scope: ScopeType, tls: bool) -> bool {
        match self {
            Extension::FullFlush => matches!(scope, ScopeType::Http | ScopeType::Sse),
            Extension::Tls => tls && scope != ScopeType::Lifespan,
            Extension::WebSocketPing => scope == ScopeType::WebSocket,
        }
    }
}

/// The capability set attached to one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions(BTreeSet<Extension>);

impl Extensions {
    pub fn contains(&self, ext: Extension) -> bool {
        self.0.contains(&ext)
    }

    /// Capability check by name, e.g. `supports("fullflush")`.
    pub fn supports(&self, name: &str) -> bool {
        Extension::from_name(name).is_some_and(|ext| self.contains(ext))
    }

    pub fn iter(&self) -> impl Iterator<Item = Extension> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Extension> for Extensions {
    fn from_iter<I: IntoIterator<Item = Extension>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which extensions this server offers at all.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    enabled: BTreeSet<Extension>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::all()
    }
}

impl ExtensionRegistry {
    pub fn all() -> Self {
        Self {
            enabled: Extension::ALL.into_iter().collect(),
        }
    }

    pub fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
        let Some(names) = &cfg.extensions else {
            return Ok(Self::all());
        };
        let mut enabled = BTreeSet::new();
        for name in names {
            match Extension::from_name(name) {
                Some(ext) => {
                    enabled.insert(ext);
                }
                None => bail!("unknown extension {:?}", name),
            }
        }
        Ok(Self { enabled })
    }

    pub fn is_enabled(&self, ext: Extension) -> bool {
        self.enabled.contains(&ext)
    }

    /// The subset that applies to a scope of type `scope` on a connection
    /// with (`tls = true`) or without encryption.
    pub fn for_connection(&self, scope: ScopeType, tls: bool) -> Extensions {
        self.enabled
            .iter()
            .copied()
            .filter(|ext| ext.applies_to(scope, tls))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_only_offered_on_encrypted_connections() {
        let registry = ExtensionRegistry::all();
        assert!(!registry.for_connection(ScopeType::Http, false).supports("tls"));
        assert!(registry.for_connection(ScopeType::Http, true).supports("tls"));
    }

    #[test]
    fn ping_is_websocket_only() {
        let registry = ExtensionRegistry::all();
        assert!(registry
            .for_connection(ScopeType::WebSocket, false)
            .contains(Extension::WebSocketPing));
        assert!(!registry
            .for_connection(ScopeType::Http, false)
            .contains(Extension::WebSocketPing));
    }

    #[test]
    fn configured_names_limit_the_registry() {
        let mut cfg = ServerConfig::default();
        cfg.extensions = Some(vec!["fullflush".to_string()]);
        let registry = ExtensionRegistry::from_config(&cfg).unwrap();
        assert!(registry.is_enabled(Extension::FullFlush));
        assert!(!registry.is_enabled(Extension::Tls));

        cfg.extensions = Some(Vec::new());
        let registry = ExtensionRegistry::from_config(&cfg).unwrap();
        assert!(registry.for_connection(ScopeType::Http, true).is_empty());

        cfg.extensions = Some(vec!["zerocopy".to_string()]);
        assert!(ExtensionRegistry::from_config(&cfg).is_err());
    }

    #[test]
    fn unknown_names_are_not_supported() {
        let exts = ExtensionRegistry::all().for_connection(ScopeType::Http, true);
        assert!(!exts.supports("zerocopy"));
    }
}

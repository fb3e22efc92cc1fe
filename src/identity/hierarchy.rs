// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory identity forest and auth-chain resolution.
//!
//! Nodes are indexed by id; parent/child links are ids, never
//! pointers, so the structure stays acyclic-by-lookup. The gateway's
//! own identity is the mandatory root: a chain that does not terminate
//! there is incomplete and resolves to nothing.

use std::collections::{BTreeSet, HashMap};

use super::ServiceIdentity;

/// Separator between hops in a serialized auth chain.
pub const AUTH_CHAIN_SEPARATOR: char = ';';

/// Split a serialized chain (`target;hop;...;root`) into its ids.
#[must_use]
pub fn parse_auth_chain(chain: &str) -> Vec<String> {
    chain
        .split(AUTH_CHAIN_SEPARATOR)
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(str::to_string)
        .collect()
}

struct Node {
    identity: ServiceIdentity,
    children: BTreeSet<String>,
}

/// Forest of scoped identities keyed by id.
pub struct IdentityHierarchy {
    gateway_id: String,
    nodes: HashMap<String, Node>,
}

impl IdentityHierarchy {
    /// `gateway_id` is the id of this gateway's own device identity,
    /// the root every complete chain must reach.
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            nodes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Effective parent id: the explicit parent, or the device part of
    /// a module id. The gateway root has no parent.
    fn parent_of(identity: &ServiceIdentity) -> Option<String> {
        identity
            .parent_id
            .clone()
            .or_else(|| identity.module_id().map(|_| identity.device_id().to_string()))
    }

    /// Insert or replace a node, preserving its children. A node whose
    /// parent later (re)appears is re-attached automatically.
    pub fn insert_or_update(&mut self, identity: ServiceIdentity) {
        let id = identity.id.clone();
        let new_parent = Self::parent_of(&identity);
        let old_parent = self.nodes.get(&id).map(|node| Self::parent_of(&node.identity));

        match old_parent {
            Some(old_parent) => {
                if old_parent != new_parent {
                    if let Some(old) = old_parent.and_then(|pid| self.nodes.get_mut(&pid)) {
                        old.children.remove(&id);
                    }
                }
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.identity = identity;
                }
            }
            None => {
                // adopt any dangling children that already point here
                let children: BTreeSet<String> = self
                    .nodes
                    .iter()
                    .filter(|(_, node)| Self::parent_of(&node.identity).as_deref() == Some(&id))
                    .map(|(child_id, _)| child_id.clone())
                    .collect();
                self.nodes.insert(id.clone(), Node { identity, children });
            }
        }

        if let Some(parent) = new_parent.and_then(|pid| self.nodes.get_mut(&pid)) {
            parent.children.insert(id);
        }
    }

    /// Remove a node only. Its children dangle — their chains resolve
    /// to nothing — until a parent with this id reappears.
    pub fn remove(&mut self, id: &str) -> Option<ServiceIdentity> {
        let node = self.nodes.remove(id)?;
        if let Some(parent) = Self::parent_of(&node.identity).and_then(|pid| self.nodes.get_mut(&pid))
        {
            parent.children.remove(id);
        }
        Some(node.identity)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ServiceIdentity> {
        self.nodes.get(id).map(|node| &node.identity)
    }

    #[must_use]
    pub fn all_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    #[must_use]
    pub fn immediate_children(&self, id: &str) -> Vec<ServiceIdentity> {
        self.nodes
            .get(id)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|child| self.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve the auth chain for `id`: target first, then each
    /// ancestor, ending at the gateway root. `None` when any hop is
    /// missing or disabled, or the walk never reaches the root.
    #[must_use]
    pub fn auth_chain(&self, id: &str) -> Option<String> {
        let mut hops = Vec::new();
        let mut current = id.to_string();
        loop {
            let node = self.nodes.get(&current)?;
            if !node.identity.is_enabled() {
                return None;
            }
            hops.push(current.clone());
            if current == self.gateway_id {
                break;
            }
            // a malformed parent loop would otherwise walk forever
            if hops.len() > self.nodes.len() {
                return None;
            }
            current = Self::parent_of(&node.identity)?;
        }
        Some(hops.join(&AUTH_CHAIN_SEPARATOR.to_string()))
    }
}

//! Member table merged by push-pull gossip
//!
//! Heartbeats are the only version: a digest replaces the local entry only when
//! it carries a higher heartbeat. Members whose heartbeat stops advancing for
//! the dead timeout are marked failed; failed and left entries stay in the
//! table as tombstones so stale digests cannot resurrect them.

use super::wire::Digest;
use crate::cluster::membership::Node;

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Membership change produced by a merge or reap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Join(Node),
    Leave(Node),
    Update(Node),
}

#[derive(Debug, Clone)]
struct Member {
    node: Node,
    heartbeat: u64,
    left: bool,
    alive: bool,
    meta: Vec<u8>,
    last_advance: Instant,
}

impl Member {
    fn digest(&self) -> Digest {
        Digest {
            name: self.node.name.clone(),
            addr: self.node.addr,
            heartbeat: self.heartbeat,
            left: self.left,
            meta: self.meta.clone(),
        }
    }

    fn is_live(&self) -> bool {
        self.alive && !self.left
    }
}

#[derive(Debug)]
pub struct MemberTable {
    local: String,
    members: HashMap<String, Member>,
    dead_timeout: Duration,
}

impl MemberTable {
    pub fn new(local: Node, heartbeat: u64, meta: Vec<u8>, dead_timeout: Duration, now: Instant) -> Self {
        let name = local.name.clone();
        let mut members = HashMap::new();
        members.insert(
            name.clone(),
            Member {
                node: local,
                heartbeat,
                left: false,
                alive: true,
                meta,
                last_advance: now,
            },
        );
        Self {
            local: name,
            members,
            dead_timeout,
        }
    }

    fn local_mut(&mut self) -> Option<&mut Member> {
        self.members.get_mut(&self.local)
    }

    /// Advance the local heartbeat
    pub fn tick(&mut self, now: Instant) {
        if let Some(local) = self.local_mut() {
            local.heartbeat += 1;
            local.last_advance = now;
        }
    }

    /// Mark the local node as leaving
    pub fn leave_local(&mut self, now: Instant) {
        if let Some(local) = self.local_mut() {
            local.heartbeat += 1;
            local.left = true;
            local.last_advance = now;
        }
    }

    /// Entries worth advertising: live members and announced departures
    pub fn digests(&self) -> Vec<Digest> {
        self.members
            .values()
            .filter(|m| m.alive || m.left)
            .map(Member::digest)
            .collect()
    }

    /// Merge a remote view, returning the resulting membership changes
    pub fn merge(&mut self, digests: Vec<Digest>, now: Instant) -> Vec<MemberEvent> {
        let mut events = Vec::new();

        for digest in digests {
            if digest.name == self.local {
                // A peer remembers a newer heartbeat from a previous run
                if let Some(local) = self.local_mut() {
                    if digest.heartbeat >= local.heartbeat && !local.left {
                        local.heartbeat = digest.heartbeat + 1;
                    }
                }
                continue;
            }

            match self.members.get_mut(&digest.name) {
                None => {
                    if digest.left {
                        continue;
                    }
                    let node = Node::new(digest.name.clone(), digest.addr);
                    events.push(MemberEvent::Join(node.clone()));
                    self.members.insert(
                        digest.name,
                        Member {
                            node,
                            heartbeat: digest.heartbeat,
                            left: false,
                            alive: true,
                            meta: digest.meta,
                            last_advance: now,
                        },
                    );
                }
                Some(member) => {
                    if digest.heartbeat <= member.heartbeat {
                        continue;
                    }
                    member.heartbeat = digest.heartbeat;
                    member.last_advance = now;
                    member.meta = digest.meta;

                    if digest.left {
                        let was_live = member.is_live();
                        member.left = true;
                        member.alive = false;
                        if was_live {
                            events.push(MemberEvent::Leave(member.node.clone()));
                        }
                        continue;
                    }

                    let moved = member.node.addr != digest.addr;
                    member.node.addr = digest.addr;
                    if !member.is_live() {
                        member.alive = true;
                        member.left = false;
                        events.push(MemberEvent::Join(member.node.clone()));
                    } else if moved {
                        events.push(MemberEvent::Update(member.node.clone()));
                    }
                }
            }
        }

        events
    }

    /// Fail members whose heartbeat stalled for the dead timeout
    pub fn reap(&mut self, now: Instant) -> Vec<MemberEvent> {
        let mut events = Vec::new();
        for member in self.members.values_mut() {
            if member.node.name == self.local || !member.is_live() {
                continue;
            }
            if now.saturating_duration_since(member.last_advance) >= self.dead_timeout {
                member.alive = false;
                events.push(MemberEvent::Leave(member.node.clone()));
            }
        }
        events
    }

    /// Live members including the local node, sorted by name
    pub fn live(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .members
            .values()
            .filter(|m| m.is_live())
            .map(|m| m.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn live_count(&self) -> usize {
        self.members.values().filter(|m| m.is_live()).count()
    }

    /// Live peers excluding the local node
    pub fn peers(&self) -> Vec<Node> {
        self.members
            .values()
            .filter(|m| m.is_live() && m.node.name != self.local)
            .map(|m| m.node.clone())
            .collect()
    }

    pub fn random_peer(&self) -> Option<Node> {
        self.peers().choose(&mut rand::thread_rng()).cloned()
    }
}

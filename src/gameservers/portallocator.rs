/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use parking_lot::Mutex;

use crate::{
    apis::{
        gameserver::{PortPolicy, Protocol},
        GameServer,
    },
    watch::EventHandler,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("{needed} ports requested but the range {min}-{max} only holds {available}")]
    RangeTooSmall {
        needed: usize,
        available: usize,
        min: u16,
        max: u16,
    },
}

/// Taken host ports on one node. Slots are not tied to a particular node,
/// there is simply one per schedulable node.
type Slot = BTreeSet<u16>;

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    /// Game servers whose ports this allocator handed out, by uid.
    registry: HashSet<String>,
}

/// Hands out host ports from `[min, max]` to dynamic and passthrough ports.
pub struct PortAllocator {
    min: u16,
    max: u16,
    state: Mutex<State>,
}

fn is_allocated_policy(policy: PortPolicy) -> bool {
    matches!(policy, PortPolicy::Dynamic | PortPolicy::Passthrough)
}

fn uid(gs: &GameServer) -> String {
    gs.metadata
        .uid
        .clone()
        .unwrap_or_else(|| crate::apis::key(gs))
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        tracing::debug!(min, max, "starting port allocator");
        Self {
            min,
            max,
            state: <_>::default(),
        }
    }

    fn range_len(&self) -> usize {
        usize::from(self.max.saturating_sub(self.min)) + 1
    }

    fn in_range(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Rebuilds every slot from the current nodes and game servers. Called
    /// once the caches have synced, and whenever the set of schedulable
    /// nodes changes.
    pub fn sync(&self, nodes: &[Arc<Node>], game_servers: &[Arc<GameServer>]) {
        let mut by_node: HashMap<String, Slot> = nodes
            .iter()
            .filter(|node| {
                !node
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.unschedulable)
                    .unwrap_or(false)
            })
            .map(|node| (node.name_any(), Slot::new()))
            .collect();

        let mut registry = HashSet::new();
        let mut unplaced = Vec::new();
        let mut usage: HashMap<String, usize> = HashMap::new();

        for gs in game_servers {
            for port in gs.spec.ports.iter().filter(|port| is_allocated_policy(port.port_policy)) {
                registry.insert(uid(gs));
                let Some(host_port) = port.host_port else {
                    continue;
                };

                match by_node.get_mut(gs.node_name()) {
                    Some(slot) => {
                        slot.insert(host_port);
                        *usage.entry(gs.node_name().to_owned()).or_default() += 1;
                    }
                    None => unplaced.push(host_port),
                }
            }
        }

        let mut nodes: Vec<(String, Slot)> = by_node.into_iter().collect();
        // Busiest first, so new ports pack onto the same slots.
        nodes.sort_by(|(a, _), (b, _)| {
            usage
                .get(b)
                .unwrap_or(&0)
                .cmp(usage.get(a).unwrap_or(&0))
                .then_with(|| a.cmp(b))
        });
        let mut slots: Vec<Slot> = nodes.into_iter().map(|(_, slot)| slot).collect();

        for port in unplaced {
            if let Some(slot) = slots.iter_mut().find(|slot| !slot.contains(&port)) {
                slot.insert(port);
            }
        }

        tracing::debug!(slots = slots.len(), game_servers = registry.len(), "resetting port allocation");
        *self.state.lock() = State { slots, registry };
    }

    /// Assigns host ports to every dynamic and passthrough port of `gs`,
    /// adding a slot when the existing ones are full. `TCPUDP` ports are
    /// split into a `-tcp` and a `-udp` port sharing one host port.
    pub fn allocate(&self, gs: &mut GameServer) -> Result<(), Error> {
        let needed = gs
            .spec
            .ports
            .iter()
            .filter(|port| is_allocated_policy(port.port_policy))
            .count();

        if needed == 0 {
            return Ok(());
        }

        if needed > self.range_len() {
            return Err(Error::RangeTooSmall {
                needed,
                available: self.range_len(),
                min: self.min,
                max: self.max,
            });
        }

        let mut state = self.state.lock();
        let picks = loop {
            let mut picks: Vec<(usize, u16)> = Vec::with_capacity(needed);
            let mut chosen = BTreeSet::new();
            'slots: for (index, slot) in state.slots.iter().enumerate() {
                for port in self.min..=self.max {
                    if picks.len() == needed {
                        break 'slots;
                    }
                    if !slot.contains(&port) && chosen.insert(port) {
                        picks.push((index, port));
                    }
                }
            }

            if picks.len() == needed {
                break picks;
            }

            state.slots.push(Slot::new());
        };

        let mut picks = picks.into_iter();
        let mut extra = Vec::new();
        for port in gs
            .spec
            .ports
            .iter_mut()
            .filter(|port| is_allocated_policy(port.port_policy))
        {
            let Some((slot, host_port)) = picks.next() else {
                break;
            };
            state.slots[slot].insert(host_port);
            port.host_port = Some(host_port);
            if port.port_policy == PortPolicy::Passthrough {
                port.container_port = host_port;
            }

            if port.protocol == Protocol::UdpTcp {
                let mut udp = port.clone();
                udp.name = format!("{}-udp", port.name);
                udp.protocol = Protocol::Udp;
                extra.push(udp);

                port.name = format!("{}-tcp", port.name);
                port.protocol = Protocol::Tcp;
            }
        }

        gs.spec.ports.extend(extra);
        state.registry.insert(uid(gs));
        Ok(())
    }

    /// Releases the host ports of a game server this allocator assigned.
    pub fn deallocate(&self, gs: &GameServer) {
        let mut state = self.state.lock();
        if !state.registry.remove(&uid(gs)) {
            tracing::debug!(gs = %gs.name_any(), "did not allocate this game server, ignoring");
            return;
        }

        for port in gs.spec.ports.iter().filter_map(|port| port.host_port) {
            if !self.in_range(port) {
                continue;
            }
            // Split TCPUDP ports share a host port that was only taken once.
            if let Some(slot) = state.slots.iter_mut().find(|slot| slot.contains(&port)) {
                slot.remove(&port);
            }
        }
    }

    #[cfg(test)]
    fn taken(&self) -> usize {
        self.state.lock().slots.iter().map(BTreeSet::len).sum()
    }
}

impl EventHandler<GameServer> for PortAllocator {
    fn on_delete(&self, gs: &Arc<GameServer>) {
        self.deallocate(gs);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeSpec;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::gameserver::GameServerPort;

    fn node(name: &str, unschedulable: bool) -> Arc<Node> {
        Arc::new(Node {
            metadata: kube::api::ObjectMeta {
                name: Some(name.into()),
                ..<_>::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..<_>::default()
            }),
            ..<_>::default()
        })
    }

    fn gs(name: &str, ports: Vec<GameServerPort>) -> GameServer {
        let mut gs = GameServer::new(name, <_>::default());
        gs.metadata.uid = Some(format!("uid-{name}"));
        gs.spec.ports = ports;
        gs
    }

    fn port(name: &str, policy: PortPolicy, protocol: Protocol) -> GameServerPort {
        GameServerPort {
            name: name.into(),
            port_policy: policy,
            container_port: 7777,
            protocol,
            ..<_>::default()
        }
    }

    #[test]
    fn allocates_within_range_and_adds_slots() {
        let allocator = PortAllocator::new(10, 11);
        allocator.sync(&[node("n1", false)], &[]);

        let mut first = gs(
            "a",
            vec![
                port("game", PortPolicy::Dynamic, Protocol::Udp),
                port("query", PortPolicy::Dynamic, Protocol::Tcp),
            ],
        );
        allocator.allocate(&mut first).unwrap();
        assert_eq!(Some(10), first.spec.ports[0].host_port);
        assert_eq!(Some(11), first.spec.ports[1].host_port);

        // The only node is full, a second slot is added.
        let mut second = gs("b", vec![port("game", PortPolicy::Dynamic, Protocol::Udp)]);
        allocator.allocate(&mut second).unwrap();
        assert_eq!(Some(10), second.spec.ports[0].host_port);
        assert_eq!(3, allocator.taken());

        allocator.deallocate(&first);
        assert_eq!(1, allocator.taken());
        // Only once.
        allocator.deallocate(&first);
        assert_eq!(1, allocator.taken());
    }

    #[test]
    fn passthrough_and_tcpudp() {
        let allocator = PortAllocator::new(10, 20);
        let mut server = gs(
            "a",
            vec![
                port("static", PortPolicy::Static, Protocol::Udp),
                port("pass", PortPolicy::Passthrough, Protocol::Udp),
                port("both", PortPolicy::Dynamic, Protocol::UdpTcp),
            ],
        );
        server.spec.ports[0].host_port = Some(9000);

        allocator.allocate(&mut server).unwrap();
        let ports = &server.spec.ports;
        assert_eq!(4, ports.len());
        assert_eq!(Some(9000), ports[0].host_port);
        assert_eq!(ports[1].host_port, Some(ports[1].container_port));
        assert_eq!("both-tcp", ports[2].name);
        assert_eq!(Protocol::Tcp, ports[2].protocol);
        assert_eq!("both-udp", ports[3].name);
        assert_eq!(Protocol::Udp, ports[3].protocol);
        assert_eq!(ports[2].host_port, ports[3].host_port);
        assert!(ports[1..].iter().all(|port| (10..=20).contains(&port.host_port.unwrap())));

        allocator.deallocate(&server);
        assert_eq!(0, allocator.taken());
    }

    #[test]
    fn sync_registers_existing_ports() {
        let allocator = PortAllocator::new(10, 12);
        let mut placed = gs("a", vec![port("game", PortPolicy::Dynamic, Protocol::Udp)]);
        placed.spec.ports[0].host_port = Some(10);
        placed.status_mut().node_name = "n2".into();
        let mut unplaced = gs("b", vec![port("game", PortPolicy::Dynamic, Protocol::Udp)]);
        unplaced.spec.ports[0].host_port = Some(11);

        allocator.sync(
            &[node("n1", false), node("n2", false), node("n3", true)],
            &[Arc::new(placed.clone()), Arc::new(unplaced)],
        );
        assert_eq!(2, allocator.taken());
        assert_eq!(2, allocator.state.lock().slots.len());

        let mut next = gs("c", vec![port("game", PortPolicy::Dynamic, Protocol::Udp)]);
        allocator.allocate(&mut next).unwrap();
        assert_eq!(Some(12), next.spec.ports[0].host_port);

        allocator.deallocate(&placed);
        assert_eq!(2, allocator.taken());
    }

    #[test]
    fn range_too_small() {
        let allocator = PortAllocator::new(10, 10);
        let mut server = gs(
            "a",
            vec![
                port("a", PortPolicy::Dynamic, Protocol::Udp),
                port("b", PortPolicy::Dynamic, Protocol::Udp),
            ],
        );
        assert!(matches!(
            allocator.allocate(&mut server),
            Err(Error::RangeTooSmall { needed: 2, .. })
        ));
    }
}

// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use crate::channel::Channel;
use crate::ChannelId;

const CHANNELS_ALLOC_INIT: usize = 10;

/// Slots indexed by channel id. Freed slots are reused, lowest first.
#[derive(Debug)]
pub(crate) struct ChannelTable {
    slots: Vec<Option<Channel>>,
    max: usize,
}

impl ChannelTable {
    pub fn new(max: usize) -> Self {
        ChannelTable {
            slots: Vec::with_capacity(CHANNELS_ALLOC_INIT.min(max)),
            max,
        }
    }

    /// Allocate a slot and build the channel in it.
    pub fn insert_with<F: FnOnce(ChannelId) -> Channel>(&mut self, f: F) -> ChannelId {
        let i = match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => i,
            None => {
                // Running out of channels is not recoverable.
                assert!(
                    self.slots.len() < self.max,
                    "channel table full: {} channels",
                    self.max
                );
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = ChannelId(i as u32);
        self.slots[i] = Some(f(id));
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Lookup by an id received from the peer. Only kinds the peer
    /// may address are returned.
    pub fn get_public(&self, id: u32) -> Option<&Channel> {
        let c = self.get(ChannelId(id))?;
        if c.kind.is_public() {
            Some(c)
        } else {
            info!("Non-public channel {}, type {}.", id, c.kind.name());
            None
        }
    }

    pub fn take(&mut self, id: ChannelId) -> Option<Channel> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.take())
    }

    /// Ids of all live channels, in slot order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.slots.iter().flatten().map(|c| c.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelType;

    #[test]
    fn slots_are_reused() {
        let mut t = ChannelTable::new(3);
        let mk = |kind: fn() -> ChannelType| {
            move |id| Channel::new(id, "t", kind(), 0, 0, "t", 0)
        };
        let a = t.insert_with(mk(|| ChannelType::Open));
        let b = t.insert_with(mk(|| ChannelType::PortListener));
        assert_eq!((a, b), (ChannelId(0), ChannelId(1)));
        assert!(t.get_public(1).is_none());
        assert!(t.get_public(0).is_some());
        t.take(a);
        assert_eq!(t.insert_with(mk(|| ChannelType::Larval)), ChannelId(0));
        assert_eq!(t.len(), 2);
    }

    #[test]
    #[should_panic]
    fn exhaustion_is_fatal() {
        let mut t = ChannelTable::new(1);
        t.insert_with(|id| Channel::new(id, "t", ChannelType::Open, 0, 0, "t", 0));
        t.insert_with(|id| Channel::new(id, "t", ChannelType::Open, 0, 0, "t", 0));
    }
}

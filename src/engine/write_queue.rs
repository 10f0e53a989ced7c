use crate::channel::{Channel, ChannelId};
use std::collections::VecDeque;
use std::sync::Arc;

/// A buffer waiting to be written for a channel.
#[derive(Debug)]
pub(crate) struct WriteElement {
    pub(crate) channel: Arc<Channel>,
    pub(crate) buffer: Vec<u8>,
    /// Bytes already written, for partial stream writes.
    pub(crate) offset: usize,
    /// The blocking call waiting for the reply to this write, if any.
    pub(crate) blocking: Option<u64>,
}

impl WriteElement {
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.buffer[self.offset..]
    }
}

/// FIFO of pending writes across all sockets.
///
/// Order is only meaningful per socket: the poll cycle always picks the oldest
/// element whose channel targets the socket being written.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    elements: VecDeque<WriteElement>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, channel: Arc<Channel>, buffer: Vec<u8>, blocking: Option<u64>) {
        self.elements.push_back(WriteElement {
            channel,
            buffer,
            offset: 0,
            blocking,
        });
    }

    pub(crate) fn position<F>(&self, predicate: F) -> Option<usize>
    where
        F: FnMut(&WriteElement) -> bool,
    {
        self.elements.iter().position(predicate)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut WriteElement> {
        self.elements.get_mut(index)
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<WriteElement> {
        self.elements.remove(index)
    }

    pub(crate) fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&WriteElement) -> bool,
    {
        self.elements.retain(keep);
    }

    /// Drops every write of `channel`.
    pub(crate) fn remove_channel(&mut self, channel: ChannelId) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| e.channel.id() != channel);
        before - self.elements.len()
    }

    pub(crate) fn clear(&mut self) {
        self.elements.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Direction, Subject};

    fn channel(id: ChannelId, item: &str) -> Arc<Channel> {
        Arc::new(Channel::new(
            id,
            Subject::new(item, "ON", Direction::Out),
            "127.0.0.1:9999".parse().unwrap(),
        ))
    }

    #[test]
    fn oldest_matching_element_first() {
        let light = channel(0, "Light");
        let fan = channel(1, "Fan");
        let mut queue = WriteQueue::new();
        queue.push(fan.clone(), b"F1".to_vec(), None);
        queue.push(light.clone(), b"L1".to_vec(), None);
        queue.push(light.clone(), b"L2".to_vec(), None);

        let index = queue.position(|e| e.channel.id() == light.id()).unwrap();
        assert_eq!(queue.remove(index).unwrap().buffer, b"L1");
        let index = queue.position(|e| e.channel.id() == light.id()).unwrap();
        assert_eq!(queue.remove(index).unwrap().buffer, b"L2");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn partial_write_keeps_offset() {
        let mut queue = WriteQueue::new();
        queue.push(channel(0, "Light"), b"HELLO".to_vec(), Some(3));
        let element = queue.get_mut(0).unwrap();
        element.offset += 2;
        assert_eq!(element.remaining(), b"LLO");
        assert_eq!(element.blocking, Some(3));
    }

    #[test]
    fn remove_channel_drops_only_its_writes() {
        let light = channel(0, "Light");
        let fan = channel(1, "Fan");
        let mut queue = WriteQueue::new();
        queue.push(light.clone(), b"L1".to_vec(), None);
        queue.push(fan, b"F1".to_vec(), None);
        queue.push(light.clone(), b"L2".to_vec(), None);

        assert_eq!(queue.remove_channel(light.id()), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.position(|e| e.channel.item() != "Fan").is_none());
        queue.clear();
        assert_eq!(queue.len(), 0);
    }
}

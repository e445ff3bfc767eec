//! Bounded command pipe between senders and the task thread

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::task::command::{CommandError, CommandPacket};

/// FIFO of command packets with a fixed depth
#[derive(Debug)]
pub struct CommandPipe {
    queue: Mutex<VecDeque<CommandPacket>>,
    ready: Condvar,
    depth: usize,
}

impl CommandPipe {
    /// Create a pipe holding at most `depth` packets
    pub fn new(depth: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(depth)),
            ready: Condvar::new(),
            depth,
        }
    }

    /// Queue a packet, failing when the pipe is full
    pub fn send(&self, packet: CommandPacket) -> Result<(), CommandError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.depth {
            return Err(CommandError::PipeFull);
        }
        queue.push_back(packet);
        drop(queue);
        self.ready.notify_one();
        Ok(())
    }

    /// Take the oldest packet, waiting up to `timeout` for one to arrive
    ///
    /// `None` waits until a packet arrives or [`wake`](Self::wake) is called.
    pub fn receive(&self, timeout: Option<Duration>) -> Option<CommandPacket> {
        let mut queue = self.queue.lock();
        if let Some(packet) = queue.pop_front() {
            return Some(packet);
        }
        match timeout {
            Some(timeout) => {
                self.ready.wait_for(&mut queue, timeout);
            }
            None => self.ready.wait(&mut queue),
        }
        queue.pop_front()
    }

    /// Wake every receiver
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    /// Packets waiting
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(code: u16) -> CommandPacket {
        CommandPacket {
            msg_id: 0x1804,
            command_code: code,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_depth_limit() {
        let pipe = CommandPipe::new(2);
        pipe.send(packet(0)).unwrap();
        pipe.send(packet(1)).unwrap();
        assert!(matches!(pipe.send(packet(2)), Err(CommandError::PipeFull)));
        assert_eq!(pipe.receive(None).unwrap().command_code, 0);
        assert_eq!(pipe.len(), 1);
    }

    #[test]
    fn test_receive_times_out() {
        let pipe = CommandPipe::new(1);
        assert!(pipe.receive(Some(Duration::from_millis(10))).is_none());
        assert!(pipe.is_empty());
    }
}

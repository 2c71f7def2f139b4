use std::collections::VecDeque;

use bytes::Bytes;
use htunnel_core::transport::{ChannelRef, TrySendError};

use crate::config::CONTROL_BACKLOG_CAP;
use crate::control::ControlMessage;
use crate::error::{Error, Result};

/// The control channel of a session.
///
/// Messages that the channel cannot take right away are kept in order and
/// sent by [`ControlChannel::flush`] once the channel is writable again. The
/// backlog holds at most `capacity` bytes; a message past that fails with
/// [`Error::Overflow`].
pub struct ControlChannel {
    channel: ChannelRef,
    backlog: VecDeque<Bytes>,
    backlog_len: usize,
    capacity: usize,
}

impl ControlChannel {
    pub fn new(channel: ChannelRef) -> Self {
        Self::with_capacity(channel, CONTROL_BACKLOG_CAP)
    }
    pub fn with_capacity(channel: ChannelRef, capacity: usize) -> Self {
        Self {
            channel,
            backlog: VecDeque::new(),
            backlog_len: 0,
            capacity,
        }
    }
    pub fn label(&self) -> &str {
        self.channel.label()
    }
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }
    pub fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let buf = message.encode()?;
        log::debug!("control {} -> {:?}", self.label(), message);
        if self.has_backlog() {
            return self.queue(buf);
        }
        match self.channel.try_send(buf) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(buf)) => self.queue(buf),
            Err(TrySendError::Closed) => Err(Error::SessionClosed),
        }
    }
    fn queue(&mut self, buf: Bytes) -> Result<()> {
        let required = self.backlog_len + buf.len();
        if required > self.capacity {
            return Err(Error::Overflow {
                cap: self.capacity,
                required,
            });
        }
        self.backlog_len = required;
        self.backlog.push_back(buf);
        Ok(())
    }
    pub async fn writable(&self) -> Result<()> {
        self.channel.writable().await?;
        Ok(())
    }
    /// Sends queued messages until the channel is full again.
    pub fn flush(&mut self) -> Result<()> {
        while let Some(buf) = self.backlog.pop_front() {
            let len = buf.len();
            match self.channel.try_send(buf) {
                Ok(()) => self.backlog_len -= len,
                Err(TrySendError::Full(buf)) => {
                    self.backlog.push_front(buf);
                    return Ok(());
                }
                Err(TrySendError::Closed) => {
                    self.clear();
                    return Err(Error::SessionClosed);
                }
            }
        }
        Ok(())
    }
    pub fn close(&mut self) {
        self.clear();
        self.channel.close();
    }
    fn clear(&mut self) {
        self.backlog.clear();
        self.backlog_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ControlChannel;
    use crate::control::ControlMessage;
    use crate::error::Error;
    use crate::lane::tests::RecordingChannel;

    #[test]
    fn backlog_keeps_order() {
        let channel = Arc::new(RecordingChannel::new("control_label"));
        let mut control = ControlChannel::new(channel.clone());
        channel.set_full(true);
        control.send(&ControlMessage::ChannelCreated).unwrap();
        control
            .send(&ControlMessage::DeleteChannel {
                channel_name: "1|1".parse().unwrap(),
            })
            .unwrap();
        assert!(control.has_backlog());
        assert_eq!(channel.sent_messages(), 0);

        channel.set_full(false);
        control.flush().unwrap();
        assert!(!control.has_backlog());
        let sent = channel.messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            ControlMessage::decode(&sent[0]).unwrap(),
            ControlMessage::ChannelCreated
        );
        assert!(matches!(
            ControlMessage::decode(&sent[1]).unwrap(),
            ControlMessage::DeleteChannel { .. }
        ));
    }

    #[test]
    fn backlog_is_capped() {
        let channel = Arc::new(RecordingChannel::new("control_label"));
        let created = ControlMessage::ChannelCreated.encode().unwrap().len();
        let mut control = ControlChannel::with_capacity(channel.clone(), created * 2);
        channel.set_full(true);
        control.send(&ControlMessage::ChannelCreated).unwrap();
        control.send(&ControlMessage::ChannelCreated).unwrap();
        assert!(matches!(
            control.send(&ControlMessage::ChannelCreated),
            Err(Error::Overflow { required, .. }) if required == created * 3
        ));

        // flushed messages free their share of the cap
        channel.set_full(false);
        control.flush().unwrap();
        assert_eq!(channel.sent_messages(), 2);
        channel.set_full(true);
        control.send(&ControlMessage::ChannelCreated).unwrap();
        control.send(&ControlMessage::ChannelCreated).unwrap();
        assert!(control.send(&ControlMessage::ChannelCreated).is_err());
    }
}

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::config::StrandConfig;
use crate::error::StrandError;
use crate::future::{Promise, Resolver};

// A blocked operation. The callback runs after the registry borrow is released.
struct WaitingSender<V> {
    ticket: u64,
    value: V,
    ack: Box<dyn FnOnce()>,
}

struct WaitingReceiver<V> {
    ticket: u64,
    deliver: Box<dyn FnOnce(V)>,
}

struct Channel<V> {
    buffer_size: usize, // 0 = synchronous handoff
    buffer: VecDeque<V>,
    waiting_senders: VecDeque<WaitingSender<V>>,
    waiting_receivers: VecDeque<WaitingReceiver<V>>,
}

impl<V> Channel<V> {
    fn can_send(&self) -> bool {
        !self.waiting_receivers.is_empty() || self.buffer.len() < self.buffer_size
    }

    fn can_receive(&self) -> bool {
        !self.buffer.is_empty() || !self.waiting_senders.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub buffer_size: usize,
    pub buffered: usize,
    pub waiting_senders: usize,
    pub waiting_receivers: usize,
}

/// One operation offered to [`Registry::select`].
#[derive(Debug, Clone, PartialEq)]
pub enum SelectCase<V> {
    Send { channel: String, value: V },
    Receive { channel: String },
}

impl<V> SelectCase<V> {
    pub fn send(channel: &str, value: V) -> Self {
        SelectCase::Send { channel: channel.to_string(), value }
    }

    pub fn receive(channel: &str) -> Self {
        SelectCase::Receive { channel: channel.to_string() }
    }

    pub fn channel(&self) -> &str {
        match self {
            SelectCase::Send { channel, .. } | SelectCase::Receive { channel } => channel,
        }
    }
}

/// Winning case index, with the value when that case was a receive.
pub type Selected<V> = (usize, Option<V>);

struct RegistryInner<V> {
    channels: HashMap<String, Channel<V>>,
    max_channels: usize,
    next_ticket: u64,
}

impl<V> RegistryInner<V> {
    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn withdraw(&mut self, tickets: &[(String, u64)]) {
        for (name, ticket) in tickets {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.waiting_senders.retain(|sender| sender.ticket != *ticket);
                channel.waiting_receivers.retain(|receiver| receiver.ticket != *ticket);
            }
        }
    }
}

// Shared by every queued case of one pending select.
struct SelectGroup<V> {
    registry: Weak<RefCell<RegistryInner<V>>>,
    tickets: Vec<(String, u64)>,
    resolver: Resolver<Selected<V>>,
}

impl<V: Clone + 'static> SelectGroup<V> {
    fn win(&self, index: usize, value: Option<V>) {
        if let Some(inner) = self.registry.upgrade() {
            inner.borrow_mut().withdraw(&self.tickets);
        }
        log::trace!("select case {} won", index);
        self.resolver.resolve((index, value));
    }
}

/// Named, bounded FIFO channels whose send and receive complete through
/// promises.
///
/// A registry is a handle; clones share the same set of channels. Each
/// cooperative domain owns its own registry.
pub struct Registry<V> {
    inner: Rc<RefCell<RegistryInner<V>>>,
}

impl<V> Clone for Registry<V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<V: Clone + 'static> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + 'static> Registry<V> {
    pub fn new() -> Self {
        Self::from_config(&StrandConfig::default())
    }

    pub fn from_config(config: &StrandConfig) -> Self {
        Self::with_max_channels(config.max_channels)
    }

    pub fn with_max_channels(max_channels: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                channels: HashMap::new(),
                max_channels,
                next_ticket: 0,
            })),
        }
    }

    /// Opens a channel under `name` holding up to `buffer_size` values
    /// (unbuffered when `None`). Returns the name.
    pub fn create_channel(&self, name: &str, buffer_size: Option<usize>) -> Result<String, StrandError> {
        let mut inner = self.inner.borrow_mut();
        if inner.channels.contains_key(name) {
            return Err(StrandError::channel_exists(name));
        }
        if inner.channels.len() >= inner.max_channels {
            return Err(StrandError::channel_limit(inner.max_channels));
        }

        let buffer_size = buffer_size.unwrap_or(0);
        inner.channels.insert(
            name.to_string(),
            Channel {
                buffer_size,
                buffer: VecDeque::with_capacity(buffer_size),
                waiting_senders: VecDeque::new(),
                waiting_receivers: VecDeque::new(),
            },
        );
        log::debug!("channel '{}' opened (buffer_size={})", name, buffer_size);
        Ok(name.to_string())
    }

    /// Sends `value`. The returned promise fulfills once the value sits in the
    /// buffer or has been handed to a receiver.
    pub fn send(&self, name: &str, value: V) -> Result<Promise<()>, StrandError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let channel = inner
            .channels
            .get_mut(name)
            .ok_or_else(|| StrandError::unknown_channel(name))?;

        // Direct handoff to a waiting receiver
        if let Some(receiver) = channel.waiting_receivers.pop_front() {
            drop(guard);
            (receiver.deliver)(value);
            return Ok(Promise::resolve(()));
        }

        if channel.buffer.len() < channel.buffer_size {
            channel.buffer.push_back(value);
            return Ok(Promise::resolve(()));
        }

        // Full or unbuffered
        let (sent, resolver) = Promise::pending();
        inner.next_ticket += 1;
        channel.waiting_senders.push_back(WaitingSender {
            ticket: inner.next_ticket,
            value,
            ack: Box::new(move || {
                resolver.resolve(());
            }),
        });
        log::trace!(
            "send on '{}' blocked ({} sender(s) waiting)",
            name,
            channel.waiting_senders.len()
        );
        Ok(sent)
    }

    /// Receives the oldest value. The returned promise fulfills once a value
    /// has been dequeued.
    pub fn receive(&self, name: &str) -> Result<Promise<V>, StrandError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let channel = inner
            .channels
            .get_mut(name)
            .ok_or_else(|| StrandError::unknown_channel(name))?;

        if let Some(value) = channel.buffer.pop_front() {
            // A slot freed up: admit the oldest waiting sender.
            let admitted = channel.waiting_senders.pop_front().map(|sender| {
                channel.buffer.push_back(sender.value);
                sender.ack
            });
            drop(guard);
            if let Some(ack) = admitted {
                ack();
            }
            return Ok(Promise::resolve(value));
        }

        // Unbuffered: take straight from a waiting sender
        if let Some(sender) = channel.waiting_senders.pop_front() {
            drop(guard);
            (sender.ack)();
            return Ok(Promise::resolve(sender.value));
        }

        let (received, resolver) = Promise::pending();
        inner.next_ticket += 1;
        channel.waiting_receivers.push_back(WaitingReceiver {
            ticket: inner.next_ticket,
            deliver: Box::new(move |value| {
                resolver.resolve(value);
            }),
        });
        log::trace!(
            "receive on '{}' blocked ({} receiver(s) waiting)",
            name,
            channel.waiting_receivers.len()
        );
        Ok(received)
    }

    /// Completes exactly one of `cases`.
    ///
    /// The first case that can proceed right now wins. Otherwise every case
    /// is queued, and the first to complete withdraws the others, so a losing
    /// send never delivers its value. The promise yields the winning index,
    /// plus the value for a receive.
    pub fn select(
        &self,
        mut cases: Vec<SelectCase<V>>,
    ) -> Result<Promise<Selected<V>>, StrandError> {
        if cases.is_empty() {
            return Err(StrandError::empty_select());
        }

        let mut inner = self.inner.borrow_mut();
        let missing = cases.iter().find(|case| !inner.channels.contains_key(case.channel()));
        if let Some(missing) = missing {
            return Err(StrandError::unknown_channel(missing.channel()));
        }

        let ready = cases.iter().position(|case| {
            inner.channels.get(case.channel()).map_or(false, |channel| match case {
                SelectCase::Send { .. } => channel.can_send(),
                SelectCase::Receive { .. } => channel.can_receive(),
            })
        });
        if let Some(index) = ready {
            drop(inner);
            log::trace!("select case {} ready", index);
            return match cases.swap_remove(index) {
                SelectCase::Send { channel, value } => {
                    Ok(self.send(&channel, value)?.and_then(move |()| Ok((index, None))))
                }
                SelectCase::Receive { channel } => {
                    Ok(self.receive(&channel)?.and_then(move |value| Ok((index, Some(value)))))
                }
            };
        }

        let tickets: Vec<(String, u64)> = cases
            .iter()
            .map(|case| (case.channel().to_string(), inner.issue_ticket()))
            .collect();
        let (selected, resolver) = Promise::pending();
        let group = Rc::new(SelectGroup {
            registry: Rc::downgrade(&self.inner),
            tickets: tickets.clone(),
            resolver,
        });

        for (index, (case, (name, ticket))) in cases.into_iter().zip(tickets).enumerate() {
            let Some(channel) = inner.channels.get_mut(&name) else {
                continue;
            };
            let group = group.clone();
            match case {
                SelectCase::Send { value, .. } => channel.waiting_senders.push_back(WaitingSender {
                    ticket,
                    value,
                    ack: Box::new(move || group.win(index, None)),
                }),
                SelectCase::Receive { .. } => channel.waiting_receivers.push_back(WaitingReceiver {
                    ticket,
                    deliver: Box::new(move |value| group.win(index, Some(value))),
                }),
            }
        }
        log::trace!("select blocked on {} case(s)", group.tickets.len());
        Ok(selected)
    }

    /// Removes the channel. Promises still waiting on it never settle.
    pub fn close_channel(&self, name: &str) -> Result<(), StrandError> {
        let removed = self
            .inner
            .borrow_mut()
            .channels
            .remove(name)
            .ok_or_else(|| StrandError::unknown_channel(name))?;

        let abandoned = removed.waiting_senders.len() + removed.waiting_receivers.len();
        if abandoned > 0 {
            log::debug!("channel '{}' closed with {} waiter(s) abandoned", name, abandoned);
        } else {
            log::debug!("channel '{}' closed", name);
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().channels.is_empty()
    }

    pub fn max_channels(&self) -> usize {
        self.inner.borrow().max_channels
    }

    /// Names of the open channels, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn info(&self, name: &str) -> Result<ChannelInfo, StrandError> {
        let inner = self.inner.borrow();
        let channel = inner
            .channels
            .get(name)
            .ok_or_else(|| StrandError::unknown_channel(name))?;
        Ok(ChannelInfo {
            name: name.to_string(),
            buffer_size: channel.buffer_size,
            buffered: channel.buffer.len(),
            waiting_senders: channel.waiting_senders.len(),
            waiting_receivers: channel.waiting_receivers.len(),
        })
    }
}

impl<V> fmt::Debug for Registry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Registry")
            .field("channels", &inner.channels.len())
            .field("max_channels", &inner.max_channels)
            .finish()
    }
}

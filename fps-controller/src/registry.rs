//! # registry
//!
//! The in-flight command table. Every outgoing command is stamped with a
//! rolling 8-bit transaction tag carried in the low identifier byte; the
//! device echoes the tag in its reply, which is what routes a reply frame
//! back to its command.
//!
//! The low byte is shared between tags and response codes: an accepted
//! reply echoes the tag, a rejection carries the response code instead.
//! Tags are therefore allocated strictly above the highest response code
//! ([`TAG_MIN`]), so the two interpretations can never collide. A low
//! byte under [`TAG_MIN`] is matched to the oldest pending command for
//! its (positioner, opcode) pair.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use fps_types::{CommandId, Frame, Identifier, ResponseCode, BROADCAST_ID};

use crate::channel::BusChannel;
use crate::command::{Command, Reply, ReplyPolicy};
use crate::error::{FpsError, Result};
use crate::notifier::FrameListener;

/// Lowest allocatable transaction tag. Values below this are response
/// codes ([`ResponseCode`] tops out at 13).
pub const TAG_MIN: u8 = 14;

// ── Outcome ───────────────────────────────────────────────────────────────────

/// What a command resolved to. The reply list always contains whatever
/// arrived, even when the command failed — a broadcast that times out
/// keeps its partial replies.
#[derive(Debug)]
pub struct CommandOutcome {
    pub command: CommandId,
    pub replies: Vec<Reply>,
    pub error: Option<FpsError>,
}

impl CommandOutcome {
    pub fn into_result(self) -> Result<Vec<Reply>> {
        match self.error {
            None => Ok(self.replies),
            Some(error) => Err(error),
        }
    }
}

// ── Pending table ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PendingKey {
    command: CommandId,
    uid: u8,
    /// Target positioner id; [`BROADCAST_ID`] for broadcasts.
    target: u16,
}

struct Pending {
    replies: Vec<Reply>,
    /// Positioners a reply is still expected from; empty set for
    /// collect-until-timeout windows.
    awaiting: HashSet<u16>,
    window: bool,
    is_move: bool,
    /// Channel the command went out on; `None` means all channels.
    channel: Option<usize>,
    /// Insertion order, for oldest-pending error-code matching.
    seq: u64,
    done: Option<oneshot::Sender<CommandOutcome>>,
}

#[derive(Default)]
struct RegistryInner {
    pending: HashMap<PendingKey, Pending>,
    counters: HashMap<(u16, CommandId), u8>,
    move_locks: HashSet<u16>,
    /// Which channel each positioner was last heard on.
    routes: HashMap<u16, usize>,
    seq: u64,
}

impl RegistryInner {
    fn allocate_uid(&mut self, target: u16, command: CommandId) -> Result<u8> {
        let counter = self.counters.entry((target, command)).or_insert(TAG_MIN);
        let span = 256 - usize::from(TAG_MIN);
        for _ in 0..span {
            let uid = *counter;
            *counter = if *counter == u8::MAX { TAG_MIN } else { *counter + 1 };
            let key = PendingKey { command, uid, target };
            if !self.pending.contains_key(&key) {
                return Ok(uid);
            }
        }
        Err(FpsError::Validation(format!(
            "all transaction tags for ({target}, {command:?}) are in flight"
        )))
    }

    fn complete(&mut self, key: PendingKey, error: Option<FpsError>) {
        if let Some(mut pending) = self.pending.remove(&key) {
            if pending.is_move {
                self.move_locks.remove(&key.target);
            }
            if let Some(done) = pending.done.take() {
                let _ = done.send(CommandOutcome {
                    command: key.command,
                    replies: std::mem::take(&mut pending.replies),
                    error,
                });
            }
        }
    }

    /// Find the pending entry for a reply. Exact (opcode, tag, pid) match
    /// first, then the broadcast entry for the same (opcode, tag).
    fn match_reply(&self, command: CommandId, uid: u8, positioner_id: u16) -> Option<PendingKey> {
        let unicast = PendingKey { command, uid, target: positioner_id };
        if self.pending.contains_key(&unicast) {
            return Some(unicast);
        }
        let broadcast = PendingKey { command, uid, target: BROADCAST_ID };
        self.pending.contains_key(&broadcast).then_some(broadcast)
    }

    /// Match a rejection (low byte carries a response code, not a tag):
    /// the oldest pending command addressed to this positioner, or to the
    /// broadcast address, with this opcode.
    fn match_rejection(&self, command: CommandId, positioner_id: u16) -> Option<PendingKey> {
        self.pending
            .iter()
            .filter(|(key, _)| {
                key.command == command
                    && (key.target == positioner_id || key.target == BROADCAST_ID)
            })
            .min_by_key(|(_, pending)| pending.seq)
            .map(|(key, _)| *key)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct CommandRegistry {
    inner: Arc<StdMutex<RegistryInner>>,
    channels: Vec<Arc<dyn BusChannel>>,
}

impl CommandRegistry {
    pub fn new(channels: Vec<Arc<dyn BusChannel>>) -> Self {
        assert!(!channels.is_empty(), "registry needs at least one channel");
        Self { inner: Arc::new(StdMutex::new(RegistryInner::default())), channels }
    }

    pub fn is_move_locked(&self, positioner_id: u16) -> bool {
        self.inner.lock().unwrap().move_locks.contains(&positioner_id)
    }

    /// Submit a command and await its outcome. The reply list keeps
    /// whatever arrived even when `error` is set.
    pub async fn submit(&self, command: Command) -> CommandOutcome {
        match self.submit_inner(command).await {
            Ok(outcome) => outcome,
            Err((id, error)) => CommandOutcome { command: id, replies: Vec::new(), error: Some(error) },
        }
    }

    /// Submit and reduce to `Result`, dropping partial replies on failure.
    pub async fn send(&self, command: Command) -> Result<Vec<Reply>> {
        self.submit(command).await.into_result()
    }

    async fn submit_inner(
        &self,
        command: Command,
    ) -> std::result::Result<CommandOutcome, (CommandId, FpsError)> {
        let cid = command.id;
        let target = command.positioner_id;

        if command.is_broadcast() && !cid.broadcastable() {
            return Err((
                cid,
                FpsError::Validation(format!("{cid:?} cannot be broadcast")),
            ));
        }

        let timeout = command.effective_timeout();

        // Reserve the in-flight entry.
        let (key, rx, channel_idx) = {
            let mut inner = self.inner.lock().unwrap();

            if inner.move_locks.contains(&target) {
                if cid.is_move() {
                    return Err((
                        cid,
                        FpsError::Validation(format!(
                            "a move command is already in flight on positioner {target}"
                        )),
                    ));
                }
                if !cid.is_safe() {
                    return Err((
                        cid,
                        FpsError::Validation(format!(
                            "positioner {target} has a move in flight and {cid:?} is not safe"
                        )),
                    ));
                }
            }

            let uid = inner.allocate_uid(target, cid).map_err(|e| (cid, e))?;
            let key = PendingKey { command: cid, uid, target };

            let (awaiting, window) = match &command.replies {
                ReplyPolicy::Unicast => (HashSet::from([target]), false),
                ReplyPolicy::All(pids) => (pids.iter().copied().collect(), false),
                ReplyPolicy::Window => (HashSet::new(), true),
            };

            let channel_idx = if command.is_broadcast() {
                None
            } else {
                Some(inner.routes.get(&target).copied().unwrap_or(0))
            };

            let (tx, rx) = oneshot::channel();
            inner.seq += 1;
            let seq = inner.seq;
            inner.pending.insert(
                key,
                Pending {
                    replies: Vec::new(),
                    awaiting,
                    window,
                    is_move: cid.is_move(),
                    channel: channel_idx,
                    seq,
                    done: Some(tx),
                },
            );
            if cid.is_move() {
                inner.move_locks.insert(target);
            }
            (key, rx, channel_idx)
        };

        // If the awaiting future is dropped, the guard clears the entry
        // and the move lock.
        let guard = PendingGuard { inner: self.inner.clone(), key };

        // Per-command timeout.
        let inner_timeout = self.inner.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = inner_timeout.lock().unwrap();
            if let Some(pending) = inner.pending.get(&key) {
                let error = if pending.window {
                    // Discovery windows succeed with whatever arrived.
                    None
                } else {
                    let mut missing: Vec<u16> = pending.awaiting.iter().copied().collect();
                    missing.sort_unstable();
                    Some(FpsError::Timeout { command: key.command, missing })
                };
                inner.complete(key, error);
            }
        });

        // Transmit. Broadcasts go out on every channel.
        let identifier = Identifier::new(target, cid.into(), key.uid).map_err(|e| (cid, e.into()))?;
        let frame = Frame::new(identifier, &command.payload).map_err(|e| (cid, e.into()))?;
        let send_result = match channel_idx {
            Some(idx) => self.channels[idx].send(frame).await,
            None => {
                let mut result = Ok(());
                for channel in &self.channels {
                    if let Err(e) = channel.send(frame).await {
                        result = Err(e);
                        break;
                    }
                }
                result
            }
        };
        if let Err(error) = send_result {
            timeout_task.abort();
            drop(guard);
            return Err((cid, error));
        }

        let outcome = rx.await;
        timeout_task.abort();
        drop(guard);
        outcome.map_err(|_| (cid, FpsError::Cancelled { command: cid }))
    }
}

/// Removes the pending entry (and move lock) if the awaiting future goes
/// away before the command resolves.
struct PendingGuard {
    inner: Arc<StdMutex<RegistryInner>>,
    key: PendingKey,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending.remove(&self.key) {
            if pending.is_move {
                inner.move_locks.remove(&self.key.target);
            }
            debug!("registry: cancelled pending {:?}", self.key.command);
        }
    }
}

// ── Reply routing ─────────────────────────────────────────────────────────────

#[async_trait]
impl FrameListener for CommandRegistry {
    async fn on_frame(&self, channel: usize, frame: Frame) {
        let identifier = match frame.parse_identifier() {
            Ok(id) => id,
            Err(e) => {
                debug!("registry: undecodable frame: {e}");
                return;
            }
        };
        let command = match identifier.command() {
            Ok(cid) => cid,
            Err(_) => {
                debug!("registry: frame with unknown opcode {}", identifier.command_id);
                return;
            }
        };
        let positioner_id = identifier.positioner_id;

        let mut inner = self.inner.lock().unwrap();
        inner.routes.insert(positioner_id, channel);

        let (key, response_code) = if identifier.code >= TAG_MIN {
            // Accepted reply: the low byte echoes our tag.
            match inner.match_reply(command, identifier.code, positioner_id) {
                Some(key) => (key, ResponseCode::CommandAccepted),
                None => {
                    warn!(
                        "registry: orphan reply {command:?} tag {} from positioner {positioner_id}",
                        identifier.code
                    );
                    return;
                }
            }
        } else {
            // Rejection: the low byte carries the response code.
            let code = match identifier.response_code() {
                Ok(code) => code,
                Err(e) => {
                    warn!("registry: {e}");
                    return;
                }
            };
            match inner.match_rejection(command, positioner_id) {
                Some(key) => (key, code),
                None => {
                    warn!(
                        "registry: orphan rejection {command:?} ({code:?}) from positioner {positioner_id}"
                    );
                    return;
                }
            }
        };

        let Some(pending) = inner.pending.get_mut(&key) else { return };
        pending.replies.push(Reply {
            positioner_id,
            command,
            uid: key.uid,
            response_code,
            data: frame.payload().to_vec(),
        });
        pending.awaiting.remove(&positioner_id);

        let finished = !pending.window && pending.awaiting.is_empty();
        if finished {
            inner.complete(key, None);
        }
    }

    async fn on_channel_error(&self, channel: usize, error: FpsError) {
        let mut inner = self.inner.lock().unwrap();
        let affected: Vec<PendingKey> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.channel.is_none() || p.channel == Some(channel))
            .map(|(key, _)| *key)
            .collect();
        for key in affected {
            inner.complete(key, Some(FpsError::Bus(error.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;
    use crate::virtual_bus::{VirtualBus, VirtualChannel};
    use std::time::Duration;

    /// A device-side task that answers GET_STATUS for the given ids,
    /// echoing the tag and returning a fixed status word.
    fn spawn_responder(channel: VirtualChannel, ids: Vec<u16>) {
        tokio::spawn(async move {
            while let Ok(frame) = channel.receive().await {
                let id = frame.parse_identifier().unwrap();
                let targets: Vec<u16> = if id.is_broadcast() {
                    ids.clone()
                } else if ids.contains(&id.positioner_id) {
                    vec![id.positioner_id]
                } else {
                    continue;
                };
                for pid in targets {
                    let reply_id = Identifier::new(pid, id.command_id, id.code).unwrap();
                    let reply = Frame::new(reply_id, &1u32.to_be_bytes()).unwrap();
                    channel.send(reply).await.unwrap();
                }
            }
        });
    }

    async fn registry_on_bus(ids: Vec<u16>) -> Arc<CommandRegistry> {
        let bus = VirtualBus::new();
        let controller = Arc::new(bus.channel());
        spawn_responder(bus.channel(), ids);

        let registry =
            Arc::new(CommandRegistry::new(vec![controller.clone() as Arc<dyn BusChannel>]));
        let notifier = Notifier::new();
        notifier.add_listener(registry.clone()).await;
        notifier.add_channel(0, controller);
        // The notifier tasks keep running for the duration of the test.
        std::mem::forget(notifier);
        registry
    }

    #[tokio::test]
    async fn unicast_reply_correlates_by_tag() {
        let registry = registry_on_bus(vec![4]).await;
        let replies = registry.send(Command::get_status(4)).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].positioner_id, 4);
        assert!(replies[0].response_code.is_accepted());
    }

    #[tokio::test]
    async fn broadcast_collects_one_reply_per_positioner() {
        let registry = registry_on_bus(vec![1, 2, 3]).await;
        let cmd = Command::broadcast(CommandId::GetStatus, vec![1, 2, 3]);
        let replies = registry.send(cmd).await.unwrap();
        let mut pids: Vec<u16> = replies.iter().map(|r| r.positioner_id).collect();
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn broadcast_timeout_keeps_partial_replies() {
        // Positioner 3 exists in expectations but nobody answers for it.
        let registry = registry_on_bus(vec![1, 2]).await;
        let cmd = Command::broadcast(CommandId::GetStatus, vec![1, 2, 3])
            .with_timeout(Duration::from_millis(50));
        let outcome = registry.submit(cmd).await;
        assert_eq!(outcome.replies.len(), 2);
        match outcome.error {
            Some(FpsError::Timeout { missing, .. }) => assert_eq!(missing, vec![3]),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unicast_timeout_names_the_positioner() {
        let registry = registry_on_bus(vec![]).await;
        let cmd = Command::get_status(9).with_timeout(Duration::from_millis(50));
        match registry.send(cmd).await {
            Err(FpsError::Timeout { missing, .. }) => assert_eq!(missing, vec![9]),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discovery_window_succeeds_with_partial_population() {
        let registry = registry_on_bus(vec![1, 2]).await;
        let cmd = Command::get_id().collect_window(Duration::from_millis(100));
        let replies = registry.send(cmd).await.unwrap();
        assert_eq!(replies.len(), 2);
    }

    #[tokio::test]
    async fn move_commands_are_mutually_exclusive() {
        // No responder: the first goto stays in flight.
        let registry = registry_on_bus(vec![]).await;
        let first = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let cmd = Command::goto_absolute(4, 10.0, 170.0, 1_968_000)
                    .with_timeout(Duration::from_millis(200));
                registry.send(cmd).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_move_locked(4));

        let second = registry
            .send(Command::goto_absolute(4, 20.0, 170.0, 1_968_000))
            .await;
        assert!(matches!(second, Err(FpsError::Validation(_))));

        // Safe commands may interleave with the pending move.
        let status = Command::get_status(4).with_timeout(Duration::from_millis(50));
        assert!(registry.send(status).await.is_err()); // times out, but was accepted for transmit

        let _ = first.await.unwrap();
        assert!(!registry.is_move_locked(4));
    }

    #[tokio::test]
    async fn tag_allocation_skips_in_flight_tags() {
        let registry = registry_on_bus(vec![]).await;
        // Hold several commands in flight and check their tags differ.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let cmd = Command::get_status(7).with_timeout(Duration::from_millis(150));
                registry.send(cmd).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        {
            let inner = registry.inner.lock().unwrap();
            let mut uids: Vec<u8> = inner.pending.keys().map(|k| k.uid).collect();
            let before = uids.len();
            uids.dedup();
            assert_eq!(uids.len(), before);
            assert!(uids.iter().all(|&u| u >= TAG_MIN));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn tag_counter_wraps_within_the_tag_range() {
        let registry = registry_on_bus(vec![]).await;
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.counters.insert((4, CommandId::GetStatus), u8::MAX);
            let uid = inner.allocate_uid(4, CommandId::GetStatus).unwrap();
            assert_eq!(uid, u8::MAX);
            let uid = inner.allocate_uid(4, CommandId::GetStatus).unwrap();
            assert_eq!(uid, TAG_MIN);
        }
    }

    #[tokio::test]
    async fn orphan_frames_are_dropped() {
        let registry = registry_on_bus(vec![]).await;
        // A reply nobody asked for: pending table stays empty and nothing
        // panics.
        let frame =
            Frame::new(Identifier::new(5, CommandId::GetStatus.into(), 200).unwrap(), &[]).unwrap();
        registry.on_frame(0, frame).await;
        assert!(registry.inner.lock().unwrap().pending.is_empty());
    }

    #[tokio::test]
    async fn rejection_code_resolves_oldest_pending() {
        let bus = VirtualBus::new();
        let controller = Arc::new(bus.channel());
        let device = bus.channel();
        // Device that rejects every goto with ALREADY_IN_MOTION.
        tokio::spawn(async move {
            while let Ok(frame) = device.receive().await {
                let id = frame.parse_identifier().unwrap();
                let reply_id = Identifier::new(
                    id.positioner_id,
                    id.command_id,
                    ResponseCode::AlreadyInMotion.into(),
                )
                .unwrap();
                device.send(Frame::new(reply_id, &[]).unwrap()).await.unwrap();
            }
        });

        let registry =
            Arc::new(CommandRegistry::new(vec![controller.clone() as Arc<dyn BusChannel>]));
        let notifier = Notifier::new();
        notifier.add_listener(registry.clone()).await;
        notifier.add_channel(0, controller);
        std::mem::forget(notifier);

        let replies = registry
            .send(Command::goto_absolute(4, 10.0, 170.0, 1_968_000))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].response_code, ResponseCode::AlreadyInMotion);
        assert!(replies[0].accepted().is_err());
        // The failed move releases the lock on completion.
        assert!(!registry.is_move_locked(4));
    }
}

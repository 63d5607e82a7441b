//! Per-room JSON control channel: presence, file ops, approval, kick, summon.
//!
//! Everything here is ephemeral — a control room exists exactly as long as it
//! has sockets. Messages are relayed verbatim (the original text, so unknown
//! fields survive) after the routing rules below decide who hears them:
//!
//! - `join-request`       → host only (or auto-approved reply to the sender)
//! - `join-response`      → host-issued verdict, delivered to the pending guest
//! - `kick`               → host-issued, closes every socket of the target user
//! - `file-op`            → all other approved sockets, unless sender is read-only
//! - `summon`             → targeted user, or all other approved sockets
//! - `presence-update`    → all other approved sockets (and determines host)
//! - `follow-update`, `session-end`, `focus-request` → all other approved sockets
//!
//! Anything else — unknown types, non-objects, unparseable bodies — is
//! silently dropped, as are messages from senders still awaiting approval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::doc::ClientSender;
use crate::registry::{Permission, Room};

/// Snapshot of the room attributes the control plane cares about, taken from
/// the registry when the room's first socket connects.
#[derive(Debug, Clone)]
pub struct RoomPolicy {
    pub host_user_id: Option<String>,
    pub require_approval: bool,
    pub default_permission: Permission,
}

impl RoomPolicy {
    pub fn from_room(room: &Room) -> Self {
        Self {
            host_user_id: room.host_user_id.clone(),
            require_approval: room.require_approval,
            default_permission: room.default_permission.unwrap_or_default(),
        }
    }
}

struct ControlClient {
    /// Empty until the first self-announce.
    user_id: String,
    display_name: String,
    is_host: bool,
    approved: bool,
    permission: Permission,
    tx: ClientSender,
}

pub struct ControlRoom {
    policy: RoomPolicy,
    clients: HashMap<u64, ControlClient>,
    /// Guests awaiting a host verdict, keyed by their announced user id.
    pending: HashMap<String, u64>,
    /// Whether the first-to-identify fallback already crowned a host.
    host_claimed: bool,
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl ControlRoom {
    fn new(policy: RoomPolicy) -> Self {
        Self {
            policy,
            clients: HashMap::new(),
            pending: HashMap::new(),
            host_claimed: false,
        }
    }

    fn sender_is_host(&self, conn_id: u64) -> bool {
        self.clients
            .get(&conn_id)
            .map(|c| c.is_host)
            .unwrap_or(false)
    }

    fn sender_approved(&self, conn_id: u64) -> bool {
        self.clients
            .get(&conn_id)
            .map(|c| c.approved)
            .unwrap_or(false)
    }

    /// Relay `text` to every approved socket except `skip`. Dead sockets are
    /// pruned on the way through.
    fn broadcast_except(&mut self, skip: u64, text: &str) {
        self.clients.retain(|id, c| {
            if *id == skip || !c.approved {
                return true;
            }
            c.tx.send(Message::Text(text.to_string().into())).is_ok()
        });
    }

    fn broadcast_to_approved(&mut self, text: &str) {
        self.clients.retain(|_, c| {
            if !c.approved {
                return true;
            }
            c.tx.send(Message::Text(text.to_string().into())).is_ok()
        });
    }

    fn on_join_request(&mut self, conn_id: u64, obj: &Map<String, Value>) {
        let user_id = str_field(obj, "userId");
        let display_name = str_field(obj, "displayName");

        let is_host = {
            let Some(client) = self.clients.get_mut(&conn_id) else {
                return;
            };
            client.user_id = user_id.clone();
            client.display_name = display_name.clone();
            client.is_host
        };

        if self.policy.require_approval && !is_host {
            if let Some(client) = self.clients.get_mut(&conn_id) {
                client.approved = false;
            }
            if !user_id.is_empty() {
                self.pending.insert(user_id.clone(), conn_id);
            }
            let forward = json!({
                "type": "join-request",
                "userId": user_id,
                "displayName": display_name,
                "avatarUrl": obj.get("avatarUrl").cloned().unwrap_or(Value::Null),
            })
            .to_string();
            if let Some(host) = self.clients.values().find(|c| c.is_host) {
                let _ = host.tx.send(Message::Text(forward.into()));
            }
        } else if let Some(client) = self.clients.get_mut(&conn_id) {
            client.approved = true;
            let reply = json!({
                "type": "join-response",
                "approved": true,
                "permission": client.permission,
            })
            .to_string();
            let _ = client.tx.send(Message::Text(reply.into()));
        }
    }

    fn on_join_response(&mut self, obj: &Map<String, Value>) {
        let target_user = str_field(obj, "userId");
        if target_user.is_empty() {
            return;
        }
        let Some(target_conn) = self.pending.remove(&target_user) else {
            return;
        };
        let approved = obj.get("approved").and_then(Value::as_bool).unwrap_or(false);
        let permission = obj
            .get("permission")
            .and_then(|p| serde_json::from_value::<Permission>(p.clone()).ok());

        if let Some(client) = self.clients.get_mut(&target_conn) {
            client.approved = approved;
            if let Some(p) = permission {
                client.permission = p;
            }
            let reply = json!({
                "type": "join-response",
                "approved": approved,
                "permission": client.permission,
            })
            .to_string();
            let _ = client.tx.send(Message::Text(reply.into()));
        }
    }

    fn on_kick(&mut self, obj: &Map<String, Value>) {
        let target = str_field(obj, "userId");
        if target.is_empty() {
            return;
        }
        let notice = json!({ "type": "kicked" }).to_string();
        for client in self.clients.values().filter(|c| c.user_id == target) {
            let _ = client.tx.send(Message::Text(notice.clone().into()));
            let _ = client.tx.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "kicked".into(),
            })));
        }
    }

    fn on_file_op(&mut self, conn_id: u64, raw: &str) {
        let read_only = self
            .clients
            .get(&conn_id)
            .map(|c| c.permission == Permission::ReadOnly)
            .unwrap_or(true);
        if read_only {
            return;
        }
        self.broadcast_except(conn_id, raw);
    }

    fn on_summon(&mut self, conn_id: u64, obj: &Map<String, Value>, raw: &str) {
        let target = obj
            .get("targetUserId")
            .and_then(Value::as_str)
            .unwrap_or("__all__");
        if target != "__all__" {
            for client in self.clients.values().filter(|c| c.user_id == target) {
                let _ = client.tx.send(Message::Text(raw.to_string().into()));
            }
        } else {
            self.broadcast_except(conn_id, raw);
        }
    }

    fn on_presence_update(&mut self, conn_id: u64, obj: &Map<String, Value>, raw: &str) {
        let user_id = str_field(obj, "userId");
        let display_name = obj
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string);
        let pinned_host = self.policy.host_user_id.clone();
        let fallback_open = !self.host_claimed;
        let mut claimed_fallback = false;

        let approved = {
            let Some(client) = self.clients.get_mut(&conn_id) else {
                return;
            };
            if client.user_id.is_empty() && !user_id.is_empty() {
                // First self-announce decides host status, permanently.
                let is_host = match &pinned_host {
                    Some(host) => user_id == *host,
                    None => fallback_open,
                };
                if is_host {
                    client.is_host = true;
                    client.approved = true;
                    claimed_fallback = pinned_host.is_none();
                }
            }
            if !user_id.is_empty() {
                client.user_id = user_id;
            }
            if let Some(name) = display_name {
                client.display_name = name;
            }
            client.approved
        };

        if claimed_fallback {
            self.host_claimed = true;
        }
        if approved {
            self.broadcast_except(conn_id, raw);
        }
    }

    #[cfg(test)]
    fn client_state(&self, conn_id: u64) -> Option<(String, bool, bool, Permission)> {
        self.clients
            .get(&conn_id)
            .map(|c| (c.user_id.clone(), c.is_host, c.approved, c.permission))
    }
}

/// All live control rooms.
pub struct ControlHub {
    rooms: Mutex<HashMap<String, Arc<Mutex<ControlRoom>>>>,
    next_conn: AtomicU64,
}

impl Default for ControlHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHub {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        }
    }

    /// Register a socket, creating the room on first connection.
    pub async fn join(
        &self,
        room_id: &str,
        policy: RoomPolicy,
    ) -> (Arc<Mutex<ControlRoom>>, u64, mpsc::UnboundedReceiver<Message>) {
        let room = {
            let mut rooms = self.rooms.lock().await;
            rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ControlRoom::new(policy))))
                .clone()
        };

        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut r = room.lock().await;
            let approved = !r.policy.require_approval;
            let permission = r.policy.default_permission;
            r.clients.insert(
                conn_id,
                ControlClient {
                    user_id: String::new(),
                    display_name: String::new(),
                    is_host: false,
                    approved,
                    permission,
                    tx,
                },
            );
        }
        debug!(room = %room_id, conn = conn_id, "control client joined");
        (room, conn_id, rx)
    }

    /// Route one inbound text frame.
    pub async fn handle_message(
        &self,
        room: &Arc<Mutex<ControlRoom>>,
        conn_id: u64,
        raw: &str,
    ) {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(obj) = value.as_object() else {
            return;
        };
        let Some(msg_type) = obj.get("type").and_then(Value::as_str) else {
            return;
        };

        let mut r = room.lock().await;
        if !r.clients.contains_key(&conn_id) {
            return;
        }

        match msg_type {
            "join-request" => r.on_join_request(conn_id, obj),
            "presence-update" => r.on_presence_update(conn_id, obj, raw),
            "join-response" => {
                if r.sender_is_host(conn_id) {
                    r.on_join_response(obj);
                }
            }
            "kick" => {
                if r.sender_is_host(conn_id) {
                    r.on_kick(obj);
                }
            }
            "file-op" => {
                if r.sender_approved(conn_id) {
                    r.on_file_op(conn_id, raw);
                }
            }
            "summon" => {
                if r.sender_approved(conn_id) {
                    r.on_summon(conn_id, obj, raw);
                }
            }
            "follow-update" | "session-end" | "focus-request" => {
                if r.sender_approved(conn_id) {
                    r.broadcast_except(conn_id, raw);
                }
            }
            other => {
                debug!(msg_type = %other, "dropping unknown control message type");
            }
        }
    }

    /// Unregister a socket; announce the departure and drop the room when the
    /// last socket leaves.
    pub async fn leave(&self, room_id: &str, room: &Arc<Mutex<ControlRoom>>, conn_id: u64) {
        let now_empty = {
            let mut r = room.lock().await;
            if let Some(client) = r.clients.remove(&conn_id) {
                if !client.user_id.is_empty() {
                    if r.pending.get(&client.user_id) == Some(&conn_id) {
                        r.pending.remove(&client.user_id);
                    }
                    let notice = json!({
                        "type": "presence-leave",
                        "userId": client.user_id,
                    })
                    .to_string();
                    r.broadcast_to_approved(&notice);
                }
            }
            r.clients.is_empty()
        };

        if now_empty {
            let mut rooms = self.rooms.lock().await;
            if let Some(existing) = rooms.get(room_id) {
                if Arc::ptr_eq(existing, room) && existing.lock().await.clients.is_empty() {
                    rooms.remove(room_id);
                    debug!(room = %room_id, "control room dropped");
                }
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        let rooms: Vec<Arc<Mutex<ControlRoom>>> =
            self.rooms.lock().await.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.lock().await.clients.len();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn open_policy() -> RoomPolicy {
        RoomPolicy {
            host_user_id: None,
            require_approval: false,
            default_permission: Permission::ReadWrite,
        }
    }

    async fn recv_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Message>) {
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "expected no message"
        );
    }

    fn presence(user_id: &str, display_name: &str) -> String {
        json!({
            "type": "presence-update",
            "userId": user_id,
            "displayName": display_name,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_auto_approve_join() {
        let hub = ControlHub::new();
        let (room, conn, mut rx) = hub.join("r1", open_policy()).await;

        hub.handle_message(
            &room,
            conn,
            &json!({"type": "join-request", "userId": "u1", "displayName": "Alice"}).to_string(),
        )
        .await;

        let reply = recv_json(&mut rx).await;
        assert_eq!(reply["type"], "join-response");
        assert_eq!(reply["approved"], true);
        assert_eq!(reply["permission"], "read-write");
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = ControlHub::new();
        let (room, a, mut rx_a) = hub.join("r1", open_policy()).await;
        let (_, b, mut rx_b) = hub.join("r1", open_policy()).await;

        hub.handle_message(&room, a, &presence("ua", "A")).await;
        recv_json(&mut rx_b).await; // A's announce reaches B
        hub.handle_message(&room, b, &presence("ub", "B")).await;
        recv_json(&mut rx_a).await;

        let op = json!({"type": "file-op", "op": {"type": "create", "path": "test.md"}}).to_string();
        hub.handle_message(&room, a, &op).await;

        let received = recv_json(&mut rx_b).await;
        assert_eq!(received, serde_json::from_str::<Value>(&op).unwrap());
        expect_silence(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_read_only_file_op_dropped() {
        let hub = ControlHub::new();
        let policy = RoomPolicy {
            host_user_id: Some("host".into()),
            require_approval: false,
            default_permission: Permission::ReadOnly,
        };
        let (room, a, mut rx_a) = hub.join("r1", policy.clone()).await;
        let (_, b, mut rx_b) = hub.join("r1", policy).await;

        hub.handle_message(&room, a, &presence("ua", "A")).await;
        recv_json(&mut rx_b).await;
        hub.handle_message(&room, b, &presence("ub", "B")).await;
        recv_json(&mut rx_a).await;

        hub.handle_message(
            &room,
            a,
            &json!({"type": "file-op", "op": {"type": "delete", "path": "x"}}).to_string(),
        )
        .await;
        expect_silence(&mut rx_b).await;

        // Presence still flows for read-only participants.
        hub.handle_message(&room, a, &presence("ua", "A!")).await;
        assert_eq!(recv_json(&mut rx_b).await["displayName"], "A!");
    }

    #[tokio::test]
    async fn test_first_to_identify_becomes_host() {
        let hub = ControlHub::new();
        let (room, a, _rx_a) = hub.join("r1", open_policy()).await;
        let (_, b, _rx_b) = hub.join("r1", open_policy()).await;

        hub.handle_message(&room, a, &presence("ua", "A")).await;
        hub.handle_message(&room, b, &presence("ub", "B")).await;

        let r = room.lock().await;
        assert!(r.client_state(a).unwrap().1, "first identifier is host");
        assert!(!r.client_state(b).unwrap().1);
    }

    #[tokio::test]
    async fn test_pinned_host_user_id() {
        let hub = ControlHub::new();
        let policy = RoomPolicy {
            host_user_id: Some("the-host".into()),
            require_approval: false,
            default_permission: Permission::ReadWrite,
        };
        let (room, a, _rx_a) = hub.join("r1", policy.clone()).await;
        let (_, b, _rx_b) = hub.join("r1", policy).await;

        // First to identify does NOT match the pinned host.
        hub.handle_message(&room, a, &presence("guest", "G")).await;
        hub.handle_message(&room, b, &presence("the-host", "H")).await;

        let r = room.lock().await;
        assert!(!r.client_state(a).unwrap().1);
        assert!(r.client_state(b).unwrap().1);
    }

    #[tokio::test]
    async fn test_kick_requires_host() {
        let hub = ControlHub::new();
        let (room, a, mut rx_a) = hub.join("r1", open_policy()).await;
        let (_, b, mut rx_b) = hub.join("r1", open_policy()).await;

        hub.handle_message(&room, a, &presence("host", "A")).await;
        recv_json(&mut rx_b).await;
        hub.handle_message(&room, b, &presence("guest", "B")).await;
        recv_json(&mut rx_a).await;

        // Guest tries to kick the host: nothing happens.
        hub.handle_message(&room, b, &json!({"type": "kick", "userId": "host"}).to_string())
            .await;
        expect_silence(&mut rx_a).await;

        // Host kicks the guest: guest gets "kicked" then a close.
        hub.handle_message(&room, a, &json!({"type": "kick", "userId": "guest"}).to_string())
            .await;
        assert_eq!(recv_json(&mut rx_b).await["type"], "kicked");
        match timeout(Duration::from_secs(1), rx_b.recv()).await {
            Ok(Some(Message::Close(Some(frame)))) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_approval_flow() {
        let hub = ControlHub::new();
        let policy = RoomPolicy {
            host_user_id: Some("host".into()),
            require_approval: true,
            default_permission: Permission::ReadWrite,
        };
        let (room, h, mut rx_h) = hub.join("r1", policy.clone()).await;
        let (_, g, mut rx_g) = hub.join("r1", policy).await;

        // Host identifies; implicitly approved despite requireApproval.
        hub.handle_message(&room, h, &presence("host", "H")).await;
        assert!(room.lock().await.client_state(h).unwrap().2);

        // Guest requests to join; host gets the forwarded request.
        hub.handle_message(
            &room,
            g,
            &json!({
                "type": "join-request",
                "userId": "guest",
                "displayName": "G",
                "avatarUrl": "https://example.com/g.png",
            })
            .to_string(),
        )
        .await;
        let fwd = recv_json(&mut rx_h).await;
        assert_eq!(fwd["type"], "join-request");
        assert_eq!(fwd["userId"], "guest");
        assert_eq!(fwd["avatarUrl"], "https://example.com/g.png");

        // Pre-approval traffic from the guest is silenced.
        hub.handle_message(&room, g, &json!({"type": "follow-update", "target": "host"}).to_string())
            .await;
        expect_silence(&mut rx_h).await;

        // Host approves with a permission downgrade.
        hub.handle_message(
            &room,
            h,
            &json!({
                "type": "join-response",
                "userId": "guest",
                "approved": true,
                "permission": "read-only",
            })
            .to_string(),
        )
        .await;
        let verdict = recv_json(&mut rx_g).await;
        assert_eq!(verdict["approved"], true);
        assert_eq!(verdict["permission"], "read-only");

        // Approved now, so broadcasts flow...
        hub.handle_message(&room, g, &json!({"type": "session-end"}).to_string())
            .await;
        assert_eq!(recv_json(&mut rx_h).await["type"], "session-end");

        // ...but the downgraded permission still blocks file ops.
        hub.handle_message(&room, g, &json!({"type": "file-op", "op": {}}).to_string())
            .await;
        expect_silence(&mut rx_h).await;
    }

    #[tokio::test]
    async fn test_join_response_from_non_host_ignored() {
        let hub = ControlHub::new();
        let policy = RoomPolicy {
            host_user_id: Some("host".into()),
            require_approval: true,
            default_permission: Permission::ReadWrite,
        };
        let (room, h, _rx_h) = hub.join("r1", policy.clone()).await;
        let (_, g, mut rx_g) = hub.join("r1", policy.clone()).await;
        let (_, g2, mut rx_g2) = hub.join("r1", policy).await;

        hub.handle_message(&room, h, &presence("host", "H")).await;
        hub.handle_message(
            &room,
            g,
            &json!({"type": "join-request", "userId": "guest", "displayName": "G"}).to_string(),
        )
        .await;

        // Another guest cannot approve.
        hub.handle_message(
            &room,
            g2,
            &json!({"type": "join-response", "userId": "guest", "approved": true}).to_string(),
        )
        .await;
        expect_silence(&mut rx_g).await;
        assert!(!room.lock().await.client_state(g).unwrap().2);
        let _ = rx_g2;
    }

    #[tokio::test]
    async fn test_summon_targeted_and_broadcast() {
        let hub = ControlHub::new();
        let (room, a, mut rx_a) = hub.join("r1", open_policy()).await;
        let (_, b, mut rx_b) = hub.join("r1", open_policy()).await;
        let (_, c, mut rx_c) = hub.join("r1", open_policy()).await;

        hub.handle_message(&room, a, &presence("ua", "A")).await;
        hub.handle_message(&room, b, &presence("ub", "B")).await;
        hub.handle_message(&room, c, &presence("uc", "C")).await;
        // Drain presence broadcasts.
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            while timeout(Duration::from_millis(50), rx.recv()).await.is_ok() {}
        }

        hub.handle_message(
            &room,
            a,
            &json!({"type": "summon", "targetUserId": "ub", "file": "notes.md"}).to_string(),
        )
        .await;
        assert_eq!(recv_json(&mut rx_b).await["type"], "summon");
        expect_silence(&mut rx_c).await;

        hub.handle_message(
            &room,
            a,
            &json!({"type": "summon", "targetUserId": "__all__", "file": "notes.md"}).to_string(),
        )
        .await;
        assert_eq!(recv_json(&mut rx_b).await["type"], "summon");
        assert_eq!(recv_json(&mut rx_c).await["type"], "summon");
        expect_silence(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_presence_leave_and_room_drop() {
        let hub = ControlHub::new();
        let (room, a, mut rx_a) = hub.join("r1", open_policy()).await;
        let (_, b, _rx_b) = hub.join("r1", open_policy()).await;
        assert_eq!(hub.room_count().await, 1);

        hub.handle_message(&room, a, &presence("ua", "A")).await;
        hub.handle_message(&room, b, &presence("ub", "B")).await;
        recv_json(&mut rx_a).await; // B's announce

        hub.leave("r1", &room, b).await;
        let leave = recv_json(&mut rx_a).await;
        assert_eq!(leave["type"], "presence-leave");
        assert_eq!(leave["userId"], "ub");
        assert_eq!(hub.room_count().await, 1);

        hub.leave("r1", &room, a).await;
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_types_dropped() {
        let hub = ControlHub::new();
        let (room, a, _rx_a) = hub.join("r1", open_policy()).await;
        let (_, _b, mut rx_b) = hub.join("r1", open_policy()).await;

        hub.handle_message(&room, a, "not json at all").await;
        hub.handle_message(&room, a, "[1,2,3]").await;
        hub.handle_message(&room, a, &json!({"no_type": true}).to_string()).await;
        hub.handle_message(&room, a, &json!({"type": "made-up"}).to_string()).await;

        expect_silence(&mut rx_b).await;
    }
}

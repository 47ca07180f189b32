use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;

use crate::tow::tunnel::{
    protocol::{Frame, SessionId},
    session::{Session, SessionOptions, SessionSnapshot},
    transport::BoxedStream,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session id space exhausted")]
    Exhausted,
}

struct State {
    sessions: HashMap<SessionId, Arc<Session>>,
    last_id: SessionId,
}

/// Owns every live session, keyed by the id clients use to reconnect.
pub struct Registry {
    opts: SessionOptions,
    state: RwLock<State>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(opts: SessionOptions) -> Self {
        Self {
            opts,
            state: RwLock::new(State {
                sessions: HashMap::new(),
                last_id: 0,
            }),
        }
    }

    /// Reattaches `transport` to the live session `requested`, or creates a new session and
    /// announces its id to the peer with a GetId frame.
    pub async fn create_or_attach(
        &self,
        requested: Option<SessionId>,
        transport: BoxedStream,
    ) -> anyhow::Result<Arc<Session>> {
        let mut st = self.state.write().await;

        if let Some(id) = requested.filter(|id| *id != 0) {
            match st.sessions.get(&id).cloned() {
                Some(sess) if !sess.is_closed() => {
                    drop(st);
                    sess.set_transport(transport).await?;
                    tracing::info!(sid = id, "registry: session reattached");
                    return Ok(sess);
                }
                Some(_) => {
                    st.sessions.remove(&id);
                }
                None => {
                    tracing::debug!(sid = id, "registry: unknown session id; assigning a new one");
                }
            }
        }

        let id = next_free_id(&st)?;
        st.last_id = id;
        let sess = Session::new(id, transport, self.opts.clone());
        st.sessions.insert(id, sess.clone());
        drop(st);

        metrics::counter!("tow_sessions_total").increment(1);
        metrics::gauge!("tow_active_sessions").increment(1.0);

        if let Err(err) = sess.send(&Frame::GetId { id }).await {
            self.state.write().await.sessions.remove(&id);
            close_session(&sess).await;
            return Err(err.into());
        }
        sess.start()?;
        tracing::info!(sid = id, "registry: session created");
        Ok(sess)
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.state.read().await.sessions.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Removes and closes one session. Returns false if it was not registered.
    pub async fn remove_and_close(&self, id: SessionId) -> bool {
        let Some(sess) = self.state.write().await.sessions.remove(&id) else {
            return false;
        };
        close_session(&sess).await;
        true
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut st = self.state.write().await;
            st.sessions.drain().map(|(_, s)| s).collect()
        };
        for sess in sessions {
            close_session(&sess).await;
        }
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let st = self.state.read().await;
        let mut out: Vec<SessionSnapshot> = st.sessions.values().map(|s| s.snapshot()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Closes sessions that have been without a transport for longer than `linger`.
    pub async fn reap_detached(&self, linger: Duration) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut st = self.state.write().await;
            let ids: Vec<SessionId> = st
                .sessions
                .iter()
                .filter(|(_, s)| s.is_closed() || s.detached_for().is_some_and(|d| d >= linger))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| st.sessions.remove(id)).collect()
        };
        for sess in &expired {
            tracing::info!(sid = sess.id(), "registry: reaping detached session");
            close_session(sess).await;
        }
        expired.len()
    }

    pub async fn run_reaper(
        self: Arc<Self>,
        linger: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if linger.is_zero() {
            return Ok(());
        }
        let every = (linger / 4).clamp(Duration::from_millis(100), Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(every) => {
                    self.reap_detached(linger).await;
                }
            }
        }
    }
}

fn next_free_id(st: &State) -> Result<SessionId, RegistryError> {
    let mut id = st.last_id;
    for _ in 0..u16::MAX {
        id = id.wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        if !st.sessions.contains_key(&id) {
            return Ok(id);
        }
    }
    Err(RegistryError::Exhausted)
}

async fn close_session(sess: &Session) {
    let was_closed = sess.is_closed();
    if let Err(err) = sess.close().await {
        tracing::debug!(sid = sess.id(), err = %err, "registry: session close reported errors");
    }
    if !was_closed {
        metrics::gauge!("tow_active_sessions").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::tow::tunnel::{protocol, session::SessionState};

    fn registry() -> Registry {
        Registry::new(SessionOptions {
            keep_alive: Duration::from_secs(3600),
            ..SessionOptions::default()
        })
    }

    fn transport() -> (BoxedStream, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        (Box::new(ours), theirs)
    }

    async fn read_get_id(peer: &mut DuplexStream) -> SessionId {
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        match protocol::decode(&buf).unwrap() {
            Frame::GetId { id } => id,
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_sessions_get_sequential_ids_and_announce_them() {
        let reg = registry();

        let (t1, mut p1) = transport();
        let s1 = reg.create_or_attach(None, t1).await.unwrap();
        assert_eq!(read_get_id(&mut p1).await, s1.id());
        assert_eq!(s1.state(), SessionState::Running);

        let (t2, mut p2) = transport();
        let s2 = reg.create_or_attach(Some(0), t2).await.unwrap();
        assert_eq!(read_get_id(&mut p2).await, s2.id());
        assert_ne!(s1.id(), s2.id());
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn known_id_reattaches_the_same_session() {
        let reg = registry();
        let (t1, mut p1) = transport();
        let s1 = reg.create_or_attach(None, t1).await.unwrap();
        let id = read_get_id(&mut p1).await;

        let (t2, _p2) = transport();
        let again = reg.create_or_attach(Some(id), t2).await.unwrap();
        assert!(Arc::ptr_eq(&s1, &again));
        assert_eq!(reg.len().await, 1);

        // The first transport was closed by the swap.
        let mut rest = Vec::new();
        p1.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn unknown_or_closed_id_creates_a_new_session() {
        let reg = registry();
        let (t1, _p1) = transport();
        let s1 = reg.create_or_attach(Some(4242), t1).await.unwrap();
        assert_ne!(s1.id(), 4242);

        s1.close().await.unwrap();
        let (t2, _p2) = transport();
        let s2 = reg.create_or_attach(Some(s1.id()), t2).await.unwrap();
        assert!(!Arc::ptr_eq(&s1, &s2));
        assert!(!s2.is_closed());
    }

    #[tokio::test]
    async fn failed_announcement_leaves_nothing_registered() {
        let reg = registry();
        let (t, peer) = transport();
        drop(peer);

        assert!(reg.create_or_attach(None, t).await.is_err());
        assert_eq!(reg.len().await, 0);
        assert!(reg.snapshot().await.is_empty());

        let (t2, mut p2) = transport();
        let sess = reg.create_or_attach(None, t2).await.unwrap();
        assert_eq!(read_get_id(&mut p2).await, sess.id());
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn reaper_closes_only_long_detached_sessions() {
        let reg = registry();
        let (t1, p1) = transport();
        let gone = reg.create_or_attach(None, t1).await.unwrap();
        let (t2, _p2) = transport();
        let live = reg.create_or_attach(None, t2).await.unwrap();

        drop(p1);
        let mut st = gone.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(3),
            st.wait_for(|s| *s == SessionState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(reg.reap_detached(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reg.reap_detached(Duration::from_millis(10)).await, 1);

        assert!(gone.is_closed());
        assert!(reg.get(gone.id()).await.is_none());
        assert!(reg.get(live.id()).await.is_some());
    }

    #[tokio::test]
    async fn remove_and_close_and_close_all() {
        let reg = registry();
        let (t1, _p1) = transport();
        let s1 = reg.create_or_attach(None, t1).await.unwrap();
        let (t2, _p2) = transport();
        let s2 = reg.create_or_attach(None, t2).await.unwrap();

        assert!(reg.remove_and_close(s1.id()).await);
        assert!(!reg.remove_and_close(s1.id()).await);
        assert!(s1.is_closed());

        reg.close_all().await;
        assert!(s2.is_closed());
        assert_eq!(reg.len().await, 0);
        assert!(reg.snapshot().await.is_empty());
    }
}

//! Test utilities for driving the XMPP core in-process.
//!
//! A [`TestServer`] assembles an [`XmppCore`] over an in-memory repository;
//! [`TestClient`]s play the part of bound client streams, handing stanzas
//! to the core and reading whatever it writes back.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jackal_xmpp::roster::{RosterItem, Subscription};
use jackal_xmpp::storage::{RosterRepository, User, UserRepository};
use jackal_xmpp::{C2sSession, CoreConfig, InMemoryRepository, Outbound, Stanza, XmppCore};
use jid::{BareJid, FullJid};
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before concluding nothing else is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub struct TestServer {
    pub core: Arc<XmppCore>,
    pub repository: Arc<InMemoryRepository>,
}

impl TestServer {
    pub async fn start(config: CoreConfig) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        let core = XmppCore::builder(config)
            .repository(repository.clone())
            .build()
            .expect("Failed to build core");
        core.start().await.expect("Failed to start core");
        Self {
            core: Arc::new(core),
            repository,
        }
    }

    /// Server authoritative for `hosts` with default settings otherwise.
    pub async fn with_hosts(hosts: &[&str]) -> Self {
        Self::start(CoreConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..CoreConfig::default()
        })
        .await
    }

    pub async fn create_user(&self, username: &str) {
        self.repository
            .upsert_user(&User::new(username))
            .await
            .expect("Failed to create user");
    }

    /// Store a roster item for `owner` directly, returning the roster version.
    pub async fn add_contact(&self, owner: &str, contact: &str, subscription: Subscription) -> u64 {
        let item = RosterItem::new(owner, bare(contact)).with_subscription(subscription);
        self.repository
            .upsert_roster_item(&item)
            .await
            .expect("Failed to store roster item")
    }

    pub async fn connect(&self, jid: &str) -> TestClient {
        let (tx, rx) = mpsc::channel(64);
        let session = self
            .core
            .c2s()
            .open_session(self.core.context(), full(jid), tx)
            .await
            .expect("Failed to open session");
        TestClient {
            core: Arc::clone(&self.core),
            session,
            rx,
        }
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

pub struct TestClient {
    core: Arc<XmppCore>,
    pub session: Arc<C2sSession>,
    rx: mpsc::Receiver<Outbound>,
}

impl TestClient {
    pub fn jid(&self) -> &FullJid {
        self.session.jid()
    }

    pub async fn send(&self, stanza: Stanza) {
        self.core
            .c2s()
            .process(self.core.context(), &self.session, stanza)
            .await
            .expect("Failed to process stanza");
    }

    /// Send a stanza given as XML in the `jabber:client` namespace.
    pub async fn send_xml(&self, xml: &str) {
        let element: Element = xml.parse().expect("Invalid XML");
        let stanza = Stanza::try_from(element).expect("Invalid stanza");
        self.send(stanza).await;
    }

    /// Broadcast initial available presence.
    pub async fn available(&self) {
        self.send_xml("<presence xmlns='jabber:client'/>").await;
    }

    /// Next outbound stanza as an element.
    pub async fn recv(&mut self) -> Element {
        match timeout(DEFAULT_TIMEOUT, self.rx.recv()).await {
            Ok(Some(Outbound::Stanza(stanza))) => Element::from(stanza),
            Ok(Some(Outbound::Close(condition))) => {
                panic!("Stream closed with {:?}", condition)
            }
            Ok(None) => panic!("Session channel closed"),
            Err(_) => panic!("Timed out waiting for stanza"),
        }
    }

    /// Wait for the next stanza with the given element name.
    pub async fn recv_named(&mut self, name: &str) -> Element {
        loop {
            let element = self.recv().await;
            if element.name() == name {
                return element;
            }
        }
    }

    /// Everything delivered until the stream goes quiet.
    pub async fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(Some(next)) = timeout(QUIET_PERIOD, self.rx.recv()).await {
            out.push(next);
        }
        out
    }

    /// Stanzas delivered until the stream goes quiet, as elements.
    pub async fn drain_stanzas(&mut self) -> Vec<Element> {
        self.drain()
            .await
            .into_iter()
            .filter_map(|outbound| match outbound {
                Outbound::Stanza(stanza) => Some(Element::from(stanza)),
                Outbound::Close(_) => None,
            })
            .collect()
    }

    pub async fn close(&self, status: Option<&str>) {
        self.core
            .c2s()
            .close_session(
                self.core.context(),
                &self.session,
                status.map(str::to_string),
            )
            .await
            .expect("Failed to close session");
    }
}

pub fn full(jid: &str) -> FullJid {
    jid.parse().expect("Invalid full JID")
}

pub fn bare(jid: &str) -> BareJid {
    jid.parse().expect("Invalid bare JID")
}

/// The first child of a stanza, ignoring its namespace.
pub fn payload(element: &Element) -> Option<&Element> {
    element.children().next()
}

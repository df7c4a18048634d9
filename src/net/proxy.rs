//! Thin wire-driving proxies. These issue the raw map / collection / topic
//! operations against a server and decode the replies; the full typed map
//! adapter layer lives above this crate.

use tracing::warn;

use crate::asset::MapEvent;
use crate::csp::{views, Csp};
use crate::error::EngineError;
use crate::net::client::EngineClient;
use crate::net::{SetProxy, Target, SET_PROXY_CLASS};
use crate::wire::{fields, Document, WireValue};

impl EngineClient {
    pub fn remote_map(&self, path: &str) -> RemoteMap {
        self.remote_map_with(Csp::new(path, views::MAP))
    }

    pub fn remote_map_with(&self, csp: Csp) -> RemoteMap {
        let uri = csp.to_uri();
        RemoteMap {
            client: self.clone(),
            csp,
            uri,
        }
    }

    pub fn remote_topic(&self, path: &str) -> RemoteTopic {
        RemoteTopic {
            client: self.clone(),
            uri: Csp::new(path, views::TOPIC_PUBLISHER).to_uri(),
        }
    }
}

fn reply_of(doc: &Document) -> Result<&WireValue, EngineError> {
    doc.get(fields::REPLY)
        .ok_or_else(|| EngineError::Codec("reply document without a reply field".into()))
}

fn reply_bytes(doc: &Document) -> Result<Option<Vec<u8>>, EngineError> {
    match reply_of(doc)? {
        WireValue::Null => Ok(None),
        WireValue::Bytes(b) => Ok(Some(b.clone())),
        other => Err(EngineError::Codec(format!("expected bytes reply, got {other:?}"))),
    }
}

fn reply_bool(doc: &Document) -> Result<bool, EngineError> {
    reply_of(doc)?
        .as_bool()
        .ok_or_else(|| EngineError::Codec("expected boolean reply".into()))
}

fn reply_i64(doc: &Document) -> Result<i64, EngineError> {
    reply_of(doc)?
        .as_i64()
        .ok_or_else(|| EngineError::Codec("expected integer reply".into()))
}

fn key_value(key: &[u8], value: &[u8]) -> WireValue {
    WireValue::Fields(Box::new(
        Document::new()
            .with(fields::KEY, WireValue::Bytes(key.to_vec()))
            .with(fields::VALUE, WireValue::Bytes(value.to_vec())),
    ))
}

/// Decode one streamed subscription document into a map event.
fn decode_map_event(doc: &Document) -> Option<MapEvent> {
    let inner = doc.get(fields::REPLY)?.as_fields()?;
    let key = inner.get_bytes(fields::KEY)?.to_vec();
    match inner.get_i64(fields::EVENT_TYPE)? {
        1 => Some(MapEvent::Insert {
            key,
            value: inner.get_bytes(fields::NEW_VALUE)?.to_vec(),
        }),
        2 => Some(MapEvent::Update {
            key,
            old_value: inner.get_bytes(fields::OLD_VALUE)?.to_vec(),
            value: inner.get_bytes(fields::NEW_VALUE)?.to_vec(),
        }),
        3 => Some(MapEvent::Remove {
            key,
            old_value: inner.get_bytes(fields::OLD_VALUE)?.to_vec(),
        }),
        other => {
            warn!(event_type = other, "unknown map event type");
            None
        }
    }
}

pub struct RemoteMap {
    client: EngineClient,
    csp: Csp,
    uri: String,
}

impl RemoteMap {
    fn target(&self) -> Target<'_> {
        Target::Csp(&self.uri)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the replaced value unless the map was opened with
    /// `putReturnsNull`, in which case the mutation is fire-and-forget.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        if self.csp.put_returns_null {
            let doc = Document::new().with("put", key_value(key, value));
            self.client.send(self.target(), doc)?;
            return Ok(None);
        }
        self.get_and_put(key, value).await
    }

    pub async fn get_and_put(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let doc = Document::new().with("getAndPut", key_value(key, value));
        reply_bytes(&self.client.request(self.target(), doc).await?)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let doc = Document::new().with("get", WireValue::Bytes(key.to_vec()));
        reply_bytes(&self.client.request(self.target(), doc).await?)
    }

    pub async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        if self.csp.remove_returns_null {
            let doc = Document::new().with("remove", WireValue::Bytes(key.to_vec()));
            self.client.send(self.target(), doc)?;
            return Ok(None);
        }
        let doc = Document::new().with("getAndRemove", WireValue::Bytes(key.to_vec()));
        reply_bytes(&self.client.request(self.target(), doc).await?)
    }

    pub async fn put_all(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), EngineError> {
        let items = entries
            .iter()
            .map(|(k, v)| key_value(k, v))
            .collect::<Vec<_>>();
        let doc = Document::new().with("putAll", WireValue::Sequence(items));
        self.client.send(self.target(), doc)?;
        Ok(())
    }

    pub async fn put_if_absent(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let doc = Document::new().with("putIfAbsent", key_value(key, value));
        reply_bytes(&self.client.request(self.target(), doc).await?)
    }

    pub async fn replace(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let doc = Document::new().with("replace", key_value(key, value));
        reply_bytes(&self.client.request(self.target(), doc).await?)
    }

    pub async fn replace_for_old(
        &self,
        key: &[u8],
        old_value: &[u8],
        new_value: &[u8],
    ) -> Result<bool, EngineError> {
        let doc = Document::new().with(
            "replaceForOld",
            WireValue::Fields(Box::new(
                Document::new()
                    .with(fields::KEY, WireValue::Bytes(key.to_vec()))
                    .with(fields::OLD_VALUE, WireValue::Bytes(old_value.to_vec()))
                    .with(fields::NEW_VALUE, WireValue::Bytes(new_value.to_vec())),
            )),
        );
        reply_bool(&self.client.request(self.target(), doc).await?)
    }

    pub async fn remove_with_value(&self, key: &[u8], value: &[u8]) -> Result<bool, EngineError> {
        let doc = Document::new().with("removeWithValue", key_value(key, value));
        reply_bool(&self.client.request(self.target(), doc).await?)
    }

    pub async fn contains_key(&self, key: &[u8]) -> Result<bool, EngineError> {
        let doc = Document::new().with("containsKey", WireValue::Bytes(key.to_vec()));
        reply_bool(&self.client.request(self.target(), doc).await?)
    }

    pub async fn contains_value(&self, value: &[u8]) -> Result<bool, EngineError> {
        let doc = Document::new().with("containsValue", WireValue::Bytes(value.to_vec()));
        reply_bool(&self.client.request(self.target(), doc).await?)
    }

    pub async fn size(&self) -> Result<i64, EngineError> {
        let doc = Document::new().with("size", WireValue::Null);
        reply_i64(&self.client.request(self.target(), doc).await?)
    }

    pub async fn clear(&self) -> Result<(), EngineError> {
        let doc = Document::new().with("clear", WireValue::Null);
        self.client.request(self.target(), doc).await?;
        Ok(())
    }

    pub async fn key_set(&self) -> Result<RemoteSet, EngineError> {
        self.collection_view("keySet").await
    }

    pub async fn values(&self) -> Result<RemoteSet, EngineError> {
        self.collection_view("values").await
    }

    pub async fn entry_set(&self) -> Result<RemoteSet, EngineError> {
        self.collection_view("entrySet").await
    }

    async fn collection_view(&self, event: &str) -> Result<RemoteSet, EngineError> {
        let doc = Document::new().with(event, WireValue::Null);
        let reply = self.client.request(self.target(), doc).await?;
        let proxy: SetProxy = reply_of(&reply)?.decode_typed(SET_PROXY_CLASS)?;
        Ok(RemoteSet {
            client: self.client.clone(),
            csp: proxy.csp,
            cid: proxy.cid,
        })
    }

    /// Streamed map events on one TID until unsubscribed. The registration
    /// survives reconnects.
    pub fn subscribe(
        &self,
        on_event: impl Fn(MapEvent) + Send + Sync + 'static,
    ) -> Result<u64, EngineError> {
        let doc = Document::new().with("registerSubscriber", WireValue::Null);
        self.client.subscribe(&self.uri, doc, move |doc| {
            if let Some(event) = decode_map_event(doc) {
                on_event(event);
            }
        })
    }

    /// Ends the server-side listener; the terminal `reply: null` document
    /// tears down the client-side registration when it arrives.
    pub fn unsubscribe(&self, tid: u64) -> Result<(), EngineError> {
        let doc = Document::new().with("unRegisterSubscriber", WireValue::Null);
        self.client.send_on(self.target(), tid, doc)
    }

    pub async fn key_subscriber_count(&self) -> Result<i64, EngineError> {
        let doc = Document::new().with("keySubscriberCount", WireValue::Null);
        reply_i64(&self.client.request(self.target(), doc).await?)
    }

    pub async fn entry_subscriber_count(&self) -> Result<i64, EngineError> {
        let doc = Document::new().with("entrySubscriberCount", WireValue::Null);
        reply_i64(&self.client.request(self.target(), doc).await?)
    }

    pub async fn topic_subscriber_count(&self) -> Result<i64, EngineError> {
        let doc = Document::new().with("topicSubscriberCount", WireValue::Null);
        reply_i64(&self.client.request(self.target(), doc).await?)
    }
}

/// Client face of a set-proxy reply: collection operations addressed by the
/// derived csp or, interchangeably, its cid.
pub struct RemoteSet {
    client: EngineClient,
    csp: String,
    cid: u64,
}

impl RemoteSet {
    pub fn csp(&self) -> &str {
        &self.csp
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub async fn size(&self) -> Result<i64, EngineError> {
        let doc = Document::new().with("size", WireValue::Null);
        reply_i64(&self.client.request(Target::Cid(self.cid), doc).await?)
    }

    /// Same operation addressed by csp; the dispatcher must not care.
    pub async fn size_via_csp(&self) -> Result<i64, EngineError> {
        let doc = Document::new().with("size", WireValue::Null);
        reply_i64(&self.client.request(Target::Csp(&self.csp), doc).await?)
    }

    pub async fn is_empty(&self) -> Result<bool, EngineError> {
        let doc = Document::new().with("isEmpty", WireValue::Null);
        reply_bool(&self.client.request(Target::Cid(self.cid), doc).await?)
    }

    pub async fn contains(&self, element: &[u8]) -> Result<bool, EngineError> {
        let doc = Document::new().with("contains", WireValue::Bytes(element.to_vec()));
        reply_bool(&self.client.request(Target::Cid(self.cid), doc).await?)
    }

    pub async fn clear(&self) -> Result<(), EngineError> {
        let doc = Document::new().with("clear", WireValue::Null);
        self.client.request(Target::Cid(self.cid), doc).await?;
        Ok(())
    }
}

pub struct RemoteTopic {
    client: EngineClient,
    uri: String,
}

impl RemoteTopic {
    pub fn publish(&self, topic: &[u8], message: &[u8]) -> Result<(), EngineError> {
        let doc = Document::new().with(
            "publish",
            WireValue::Fields(Box::new(
                Document::new()
                    .with(fields::TOPIC, WireValue::Bytes(topic.to_vec()))
                    .with(fields::MESSAGE, WireValue::Bytes(message.to_vec())),
            )),
        );
        self.client.send(Target::Csp(&self.uri), doc)?;
        Ok(())
    }

    pub fn subscribe(
        &self,
        on_message: impl Fn(Vec<u8>, Vec<u8>) + Send + Sync + 'static,
    ) -> Result<u64, EngineError> {
        let doc = Document::new().with("registerTopicSubscriber", WireValue::Null);
        self.client.subscribe(&self.uri, doc, move |doc| {
            if let Some(first) = doc.first() {
                if first.name == "onEndOfSubscription" {
                    return;
                }
            }
            if let Some(inner) = doc.get(fields::REPLY).and_then(WireValue::as_fields) {
                if let (Some(topic), Some(message)) = (
                    inner.get_bytes(fields::TOPIC),
                    inner.get_bytes(fields::MESSAGE),
                ) {
                    on_message(topic.to_vec(), message.to_vec());
                }
            }
        })
    }
}

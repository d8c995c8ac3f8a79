use crate::codec::Value;
use crate::kv::Kv;
use crate::rpc::{RpcCaller, RpcTarget};
use crate::types::KernelError;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every key a registry scope allows with no explicit script attached.
pub const DEFAULT_HANDLER_LUA: &str = "function(method, key, data) return true end";

/// Typed shape of a registry entry's data record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataType {
    Str,
    Hash,
    /// Declared but not operationally required; every operation on it is a
    /// route error.
    Set,
}

impl DataType {
    pub fn code(&self) -> i64 {
        match self {
            DataType::Str => 0,
            DataType::Hash => 1,
            DataType::Set => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, KernelError> {
        match code {
            0 => Ok(DataType::Str),
            1 => Ok(DataType::Hash),
            2 => Ok(DataType::Set),
            other => Err(KernelError::Kv(format!("unknown data type code {other}"))),
        }
    }

    pub fn parse(name: &str) -> Result<Self, KernelError> {
        match name.to_ascii_lowercase().as_str() {
            "str" | "string" => Ok(DataType::Str),
            "hash" | "map" | "array" => Ok(DataType::Hash),
            "set" | "sorted_set" | "sset" => Ok(DataType::Set),
            other => Err(KernelError::Route(format!("unknown data type `{other}`"))),
        }
    }
}

/// Lock state of a registry entry. `Rw` is the only state a new operation
/// may begin from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Rw,
    Ro,
    Na,
}

impl LockMode {
    pub fn code(&self) -> i64 {
        match self {
            LockMode::Rw => 0,
            LockMode::Ro => 1,
            LockMode::Na => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, KernelError> {
        match code {
            0 => Ok(LockMode::Rw),
            1 => Ok(LockMode::Ro),
            2 => Ok(LockMode::Na),
            other => Err(KernelError::Kv(format!("unknown lock code {other}"))),
        }
    }
}

/// Access handler of a registry entry, JSON-encoded in the meta record:
/// `true`/`false` or `[service, method]`. Absent (`null`) falls through to
/// the entry's script policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccessHandler {
    Flag(bool),
    Rpc(String, String),
}

/// Decoded meta record of one registry key.
#[derive(Clone, Debug)]
pub struct Meta {
    pub id: i64,
    pub data_type: DataType,
    pub lock: LockMode,
    pub handler: Option<AccessHandler>,
    pub handler_lua: String,
    pub data_id: String,
}

/// Field selection of a registry operation, mirroring the wire `kwargs`:
/// `data` for str entries, a key list for reads/removals, a field map for
/// hash writes.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub data: Option<serde_json::Value>,
    pub keys: Option<QueryKeys>,
}

#[derive(Clone, Debug)]
pub enum QueryKeys {
    List(Vec<String>),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl Query {
    pub fn none() -> Self {
        Query::default()
    }

    pub fn data(data: serde_json::Value) -> Self {
        Query {
            data: Some(data),
            keys: None,
        }
    }

    pub fn keys<I: IntoIterator<Item = S>, S: Into<String>>(keys: I) -> Self {
        Query {
            data: None,
            keys: Some(QueryKeys::List(keys.into_iter().map(Into::into).collect())),
        }
    }

    pub fn fields(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Query {
            data: None,
            keys: Some(QueryKeys::Map(fields)),
        }
    }

    /// Shape handed to access handlers as their `data` argument.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        if let Some(data) = &self.data {
            out.insert("data".to_string(), data.clone());
        }
        match &self.keys {
            Some(QueryKeys::List(keys)) => {
                out.insert("keys".to_string(), serde_json::json!(keys));
            }
            Some(QueryKeys::Map(fields)) => {
                out.insert("keys".to_string(), serde_json::Value::Object(fields.clone()));
            }
            None => {}
        }
        serde_json::Value::Object(out)
    }
}

/// Seam for an embedded script engine evaluating `handler_lua`. With no
/// engine wired in, stored scripts are opaque and evaluation allows.
pub trait ScriptPolicy: Send + Sync {
    fn evaluate(
        &self,
        script: &str,
        op: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<bool, KernelError>;
}

/// One scope of the versioned key-value layer. Cheap to clone; clones share
/// the backing store handle.
#[derive(Clone)]
pub struct Registry {
    kv: Arc<dyn Kv>,
    prefix: String,
    rpc: Option<RpcCaller>,
    script: Option<Arc<dyn ScriptPolicy>>,
}

impl Registry {
    pub fn local(kv: Arc<dyn Kv>) -> Self {
        Registry {
            kv,
            prefix: String::new(),
            rpc: None,
            script: None,
        }
    }

    pub fn global(kv: Arc<dyn Kv>) -> Self {
        Registry {
            kv,
            prefix: "global".to_string(),
            rpc: None,
            script: None,
        }
    }

    /// Attach an RPC caller for `[service, method]` access handlers. Handles
    /// used inside the switchboard task itself must not carry one.
    pub fn with_rpc(mut self, caller: RpcCaller) -> Self {
        self.rpc = Some(caller);
        self
    }

    pub fn with_script(mut self, engine: Arc<dyn ScriptPolicy>) -> Self {
        self.script = Some(engine);
        self
    }

    fn prefixed(&self, kind: &str, key: &str) -> String {
        if self.prefix.is_empty() {
            format!("{kind}:{key}")
        } else {
            format!("{}:{kind}:{key}", self.prefix)
        }
    }

    fn meta_key(&self, key: &str) -> String {
        self.prefixed("meta", key)
    }

    fn data_key(&self, data_id: &str) -> String {
        self.prefixed("data", data_id)
    }

    /// Create a key. Fails with a consistency error when the key already
    /// exists; keys are never silently overwritten.
    pub async fn create(
        &self,
        key: &str,
        data_type: DataType,
        handler: Option<AccessHandler>,
        handler_lua: Option<String>,
    ) -> Result<Meta, KernelError> {
        if data_type == DataType::Set {
            return Err(KernelError::Route(
                "set entries are not implemented".to_string(),
            ));
        }
        if !self.kv.hkeys(&self.meta_key(key)).await?.is_empty() {
            return Err(KernelError::Consistency(format!(
                "registry key `{key}` already exists"
            )));
        }
        let data_id = fresh_data_id();
        let handler_lua = handler_lua.unwrap_or_else(|| DEFAULT_HANDLER_LUA.to_string());
        let fields = vec![
            ("id".to_string(), "0".to_string()),
            ("type".to_string(), data_type.code().to_string()),
            ("lock".to_string(), LockMode::Na.code().to_string()),
            (
                "handler".to_string(),
                serde_json::to_string(&handler)
                    .map_err(|e| KernelError::Kv(format!("handler encode failed: {e}")))?,
            ),
            ("handler_lua".to_string(), handler_lua),
            ("data_id".to_string(), data_id.clone()),
        ];
        self.kv.hmset(&self.meta_key(key), &fields).await?;
        if data_type == DataType::Str {
            self.kv.set(&self.data_key(&data_id), "").await?;
        }
        self.unlock(key).await?;
        self.meta_get(key).await
    }

    /// Read a key. Reads take no lock transition and leave `meta.id`
    /// untouched; they require `lock` in `{rw, ro}`.
    pub async fn get(&self, key: &str, q: &Query) -> Result<serde_json::Value, KernelError> {
        let meta = self.meta_get(key).await?;
        self.check_access(&meta, "get", key, q).await?;
        if meta.lock == LockMode::Na {
            return Err(KernelError::Lock);
        }
        self.data_get(&meta, q).await
    }

    /// Write a key: acquire (CAS on `meta.id`, lock to `na`), handler,
    /// typed write, guaranteed release back to `rw`.
    pub async fn set(&self, key: &str, q: &Query) -> Result<(), KernelError> {
        let meta = self.acquire(key).await?;
        let result = async {
            self.check_access(&meta, "set", key, q).await?;
            self.data_set(&meta, q).await
        }
        .await;
        let released = self.unlock(key).await;
        result.and(released)
    }

    /// Remove a key (or, for hash entries, listed fields of it). Same lock
    /// discipline as `set`; a removal that destroys the meta record skips
    /// the release.
    pub async fn rem(&self, key: &str, q: &Query) -> Result<(), KernelError> {
        let meta = self.acquire(key).await?;
        let result = async {
            self.check_access(&meta, "rem", key, q).await?;
            self.data_rem(key, &meta, q).await
        }
        .await;
        let released = self.unlock(key).await;
        result.and(released)
    }

    pub async fn meta_get(&self, key: &str) -> Result<Meta, KernelError> {
        let fields = self.kv.hgetall(&self.meta_key(key)).await?;
        if fields.is_empty() {
            return Err(KernelError::Route(format!(
                "registry key `{key}` not found"
            )));
        }
        parse_meta(key, &fields)
    }

    async fn acquire(&self, key: &str) -> Result<Meta, KernelError> {
        let meta = self.meta_get(key).await?;
        if meta.lock != LockMode::Rw {
            return Err(KernelError::Lock);
        }
        self.meta_id_incr(key, meta.id).await?;
        self.kv
            .hmset(
                &self.meta_key(key),
                &[("lock".to_string(), LockMode::Na.code().to_string())],
            )
            .await?;
        Ok(meta)
    }

    /// Guaranteed-release step: bump the version once more and restore
    /// `rw`. A meta record destroyed by the operation itself is fine.
    async fn unlock(&self, key: &str) -> Result<(), KernelError> {
        if self.kv.hkeys(&self.meta_key(key)).await?.is_empty() {
            return Ok(());
        }
        self.kv.hincrby(&self.meta_key(key), "id", 1).await?;
        self.kv
            .hmset(
                &self.meta_key(key),
                &[("lock".to_string(), LockMode::Rw.code().to_string())],
            )
            .await?;
        Ok(())
    }

    /// Optimistic concurrency token: the increment must observe exactly
    /// `expected + 1`, else it is rolled back and the op fails.
    async fn meta_id_incr(&self, key: &str, expected: i64) -> Result<i64, KernelError> {
        let new_id = self.kv.hincrby(&self.meta_key(key), "id", 1).await?;
        if new_id != expected + 1 {
            self.kv.hincrby(&self.meta_key(key), "id", -1).await?;
            return Err(KernelError::Consistency(format!(
                "concurrent writer won the race on `{key}`"
            )));
        }
        Ok(new_id)
    }

    async fn meta_rem(&self, key: &str) -> Result<(), KernelError> {
        let fields = self.kv.hkeys(&self.meta_key(key)).await?;
        if fields.is_empty() {
            return Err(KernelError::Route(format!(
                "registry key `{key}` not found"
            )));
        }
        self.kv.hdel(&self.meta_key(key), &fields).await
    }

    async fn check_access(
        &self,
        meta: &Meta,
        op: &str,
        key: &str,
        q: &Query,
    ) -> Result<(), KernelError> {
        let data = q.to_json();
        match &meta.handler {
            None => self.script_check(&meta.handler_lua, op, key, &data),
            Some(AccessHandler::Flag(true)) => Ok(()),
            Some(AccessHandler::Flag(false)) => Err(KernelError::Access),
            Some(AccessHandler::Rpc(service, method)) => {
                match self.rpc_check(service, method, op, key, &data).await {
                    Ok(()) => Ok(()),
                    Err(KernelError::Access) => Err(KernelError::Access),
                    Err(e) => {
                        log::warn!(
                            "registry: access handler `{service}.{method}` failed ({e}), \
                             falling back to script policy"
                        );
                        self.script_check(&meta.handler_lua, op, key, &data)
                    }
                }
            }
        }
    }

    fn script_check(
        &self,
        script: &str,
        op: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), KernelError> {
        match &self.script {
            None => Ok(()),
            Some(engine) => {
                if engine.evaluate(script, op, key, data)? {
                    Ok(())
                } else {
                    Err(KernelError::Access)
                }
            }
        }
    }

    async fn rpc_check(
        &self,
        service: &str,
        method: &str,
        op: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), KernelError> {
        let caller = self.rpc.as_ref().ok_or_else(|| {
            KernelError::Route("no rpc caller attached to this registry handle".to_string())
        })?;
        let args = vec![
            Value::from(op),
            Value::from(key),
            Value::from(data.clone()),
        ];
        let result = caller
            .call(
                RpcTarget {
                    node: None,
                    service: service.to_string(),
                    instance: None,
                },
                method,
                args,
                BTreeMap::new(),
            )
            .await?;
        if result.truthy() {
            Ok(())
        } else {
            Err(KernelError::Access)
        }
    }

    async fn data_get(&self, meta: &Meta, q: &Query) -> Result<serde_json::Value, KernelError> {
        let data_key = self.data_key(&meta.data_id);
        match meta.data_type {
            DataType::Str => match self.kv.get(&data_key).await? {
                None => Ok(serde_json::Value::Null),
                Some(raw) if raw.is_empty() => Ok(serde_json::Value::Null),
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| KernelError::Kv(format!("undecodable value: {e}"))),
            },
            DataType::Hash => {
                let fields = match &q.keys {
                    Some(QueryKeys::List(keys)) if !keys.is_empty() => keys.clone(),
                    _ => {
                        let all = self.kv.hgetall(&data_key).await?;
                        let mut out = serde_json::Map::new();
                        for (field, raw) in all {
                            out.insert(field, decode_field(&raw));
                        }
                        return Ok(serde_json::Value::Object(out));
                    }
                };
                let raws = self.kv.hmget(&data_key, &fields).await?;
                let mut out = serde_json::Map::new();
                for (field, raw) in fields.into_iter().zip(raws) {
                    out.insert(
                        field,
                        raw.map(|r| decode_field(&r)).unwrap_or(serde_json::Value::Null),
                    );
                }
                Ok(serde_json::Value::Object(out))
            }
            DataType::Set => Err(KernelError::Route(
                "set entries are not implemented".to_string(),
            )),
        }
    }

    async fn data_set(&self, meta: &Meta, q: &Query) -> Result<(), KernelError> {
        let data_key = self.data_key(&meta.data_id);
        match meta.data_type {
            DataType::Str => {
                let data = q
                    .data
                    .as_ref()
                    .ok_or_else(|| KernelError::Route("`data` is required".to_string()))?;
                let raw = serde_json::to_string(data)
                    .map_err(|e| KernelError::Kv(format!("value encode failed: {e}")))?;
                self.kv.set(&data_key, &raw).await
            }
            DataType::Hash => {
                let fields = match &q.keys {
                    Some(QueryKeys::Map(fields)) => fields,
                    _ => {
                        return Err(KernelError::Route(
                            "`keys` must be a field map".to_string(),
                        ))
                    }
                };
                let mut entries = Vec::with_capacity(fields.len());
                for (field, value) in fields {
                    let raw = serde_json::to_string(value)
                        .map_err(|e| KernelError::Kv(format!("value encode failed: {e}")))?;
                    entries.push((field.clone(), raw));
                }
                self.kv.hmset(&data_key, &entries).await
            }
            DataType::Set => Err(KernelError::Route(
                "set entries are not implemented".to_string(),
            )),
        }
    }

    async fn data_rem(&self, key: &str, meta: &Meta, q: &Query) -> Result<(), KernelError> {
        let data_key = self.data_key(&meta.data_id);
        match meta.data_type {
            DataType::Str => {
                self.meta_rem(key).await?;
                self.kv.del(&data_key).await
            }
            DataType::Hash => match &q.keys {
                Some(QueryKeys::List(fields)) if !fields.is_empty() => {
                    self.kv.hdel(&data_key, fields).await
                }
                Some(QueryKeys::Map(fields)) if !fields.is_empty() => {
                    let fields: Vec<String> = fields.keys().cloned().collect();
                    self.kv.hdel(&data_key, &fields).await
                }
                _ => {
                    let all = self.kv.hkeys(&data_key).await?;
                    self.kv.hdel(&data_key, &all).await?;
                    self.meta_rem(key).await
                }
            },
            DataType::Set => Err(KernelError::Route(
                "set entries are not implemented".to_string(),
            )),
        }
    }
}

fn decode_field(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

/// Assigned once at create and never reused; meta deletion orphans the data
/// record deterministically.
fn fresh_data_id() -> String {
    let mut seed = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut seed);
    hex::encode(Sha512::digest(seed))
}

fn parse_meta(key: &str, fields: &BTreeMap<String, String>) -> Result<Meta, KernelError> {
    let corrupt = |what: &str| KernelError::Kv(format!("corrupt meta for `{key}`: {what}"));
    let field = |name: &str| fields.get(name).ok_or_else(|| corrupt(name));
    Ok(Meta {
        id: field("id")?.parse().map_err(|_| corrupt("id"))?,
        data_type: DataType::from_code(field("type")?.parse().map_err(|_| corrupt("type"))?)?,
        lock: LockMode::from_code(field("lock")?.parse().map_err(|_| corrupt("lock"))?)?,
        handler: serde_json::from_str(field("handler")?).map_err(|_| corrupt("handler"))?,
        handler_lua: field("handler_lua")?.clone(),
        data_id: field("data_id")?.clone(),
    })
}

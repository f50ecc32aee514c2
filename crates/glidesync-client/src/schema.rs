//! Per-table schema cache
//!
//! Schemas come from the XML SCHEMA endpoint and drive all type coercion.
//! Entries expire five minutes after publication. Concurrent misses for
//! the same table coalesce: one caller fetches while the rest wait on the
//! per-table lock and read the published value.

use crate::transport::{Payload, Transport};
use glidesync_core::{GlideError, Result};
use parking_lot::{Mutex, RwLock};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use reqwest::Method;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a published schema stays valid.
pub const SCHEMA_TTL: Duration = Duration::from_secs(300);

/// One column as the schema endpoint describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaColumn {
    pub name: String,
    /// Remote `internal_type` tag.
    pub internal_type: String,
    pub max_length: Option<i64>,
    pub reference_table: Option<String>,
    pub has_choice_list: bool,
}

/// A table's columns, sorted by name.
pub type TableSchema = BTreeMap<String, SchemaColumn>;

struct Published {
    schema: Arc<TableSchema>,
    fetched_at: Instant,
}

/// Per-table slot: the fetch lock serializes misses, the published value
/// is what every waiter reads.
struct TableSlot {
    fetch_lock: tokio::sync::Mutex<()>,
    published: RwLock<Option<Published>>,
}

/// Cache of table schemas with TTL and fetch coalescing.
pub struct SchemaCache {
    slots: Mutex<HashMap<String, Arc<TableSlot>>>,
    ttl: Duration,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn slot(&self, table: &str) -> Arc<TableSlot> {
        let mut slots = self.slots.lock();
        slots
            .entry(table.to_string())
            .or_insert_with(|| {
                Arc::new(TableSlot {
                    fetch_lock: tokio::sync::Mutex::new(()),
                    published: RwLock::new(None),
                })
            })
            .clone()
    }

    fn fresh(&self, slot: &TableSlot) -> Option<Arc<TableSchema>> {
        let published = slot.published.read();
        published
            .as_ref()
            .filter(|p| p.fetched_at.elapsed() < self.ttl)
            .map(|p| p.schema.clone())
    }

    /// Get the schema for `table`, fetching it on a miss.
    ///
    /// At most one SCHEMA request is in flight per table; every waiter
    /// observes the same published `Arc`.
    pub async fn get(&self, table: &str, transport: &Transport) -> Result<Arc<TableSchema>> {
        let slot = self.slot(table);
        if let Some(schema) = self.fresh(&slot) {
            tracing::trace!(table = %table, "schema cache hit");
            return Ok(schema);
        }

        let _guard = slot.fetch_lock.lock().await;
        // A concurrent miss may have published while we waited.
        if let Some(schema) = self.fresh(&slot) {
            tracing::trace!(table = %table, "schema published while waiting");
            return Ok(schema);
        }

        tracing::debug!(table = %table, "fetching schema");
        let url = transport.schema_url(table)?;
        let payload = transport.request(Method::GET, url, None).await?;
        let text = match payload {
            Payload::Xml(text) => text,
            _ => {
                return Err(GlideError::Protocol(format!(
                    "schema endpoint for {table} did not return XML"
                )));
            }
        };
        let schema = Arc::new(parse_schema_xml(table, &text)?);

        *slot.published.write() = Some(Published {
            schema: schema.clone(),
            fetched_at: Instant::now(),
        });
        tracing::debug!(table = %table, columns = schema.len(), "schema published");
        Ok(schema)
    }

    /// Drop the cached schema for one table.
    pub fn invalidate(&self, table: &str) {
        tracing::debug!(table = %table, "invalidating schema");
        if let Some(slot) = self.slots.lock().get(table) {
            *slot.published.write() = None;
        }
    }

    /// Drop every cached schema.
    pub fn clear(&self) {
        let slots = self.slots.lock();
        tracing::debug!(tables = slots.len(), "clearing schema cache");
        for slot in slots.values() {
            *slot.published.write() = None;
        }
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(SCHEMA_TTL)
    }
}

fn attr(start: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attribute in start.attributes() {
        let attribute =
            attribute.map_err(|e| GlideError::Schema(format!("malformed schema XML: {e}")))?;
        if attribute.key.as_ref() == name {
            return Ok(Some(String::from_utf8_lossy(&attribute.value).into_owned()));
        }
    }
    Ok(None)
}

/// Parse the SCHEMA endpoint's XML: a root element named after the table
/// containing one `<element .../>` per column.
pub fn parse_schema_xml(table: &str, text: &str) -> Result<TableSchema> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut schema = TableSchema::new();
    loop {
        match reader.read_event() {
            Ok(Event::Empty(start)) | Ok(Event::Start(start))
                if start.name().as_ref() == b"element" =>
            {
                let name = attr(&start, b"name")?.ok_or_else(|| {
                    GlideError::Schema(format!("{table}: schema element without a name"))
                })?;
                let internal_type = attr(&start, b"internal_type")?.ok_or_else(|| {
                    GlideError::Schema(format!("{table}: column {name} has no internal_type"))
                })?;
                let max_length = attr(&start, b"max_length")?.and_then(|v| v.parse().ok());
                let reference_table = attr(&start, b"reference")?.filter(|v| !v.is_empty());
                let has_choice_list = attr(&start, b"choice_list")?
                    .map(|v| v == "true")
                    .unwrap_or(false);

                schema.insert(
                    name.clone(),
                    SchemaColumn {
                        name,
                        internal_type,
                        max_length,
                        reference_table,
                        has_choice_list,
                    },
                );
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(GlideError::Schema(format!(
                    "{table}: cannot parse schema XML: {e}"
                )));
            }
        }
    }

    if schema.is_empty() {
        return Err(GlideError::Schema(format!(
            "{table}: schema has no element entries"
        )));
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedBackend, ScriptedResponse};
    use glidesync_core::InstanceConfig;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const HOST_XML: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <u_dm_host>
            <element name="u_name" internal_type="string" max_length="40"/>
            <element name="u_count" internal_type="integer" max_length="40"/>
            <element name="u_owner" internal_type="reference" max_length="32" reference="u_dm_user"/>
            <element name="u_state" internal_type="integer" max_length="40" choice_list="true"/>
            <element name="sys_id" internal_type="GUID" max_length="32"/>
        </u_dm_host>
    "#};

    fn scripted_transport() -> (Transport, Arc<ScriptedBackend>) {
        let script = Arc::new(ScriptedBackend::new());
        let config = InstanceConfig::new("acme").with_credentials("admin", "secret");
        let transport = Transport::new(&config, Box::new(script.clone())).expect("transport");
        (transport, script)
    }

    #[test]
    fn test_parse_schema_xml() {
        let schema = parse_schema_xml("u_dm_host", HOST_XML).expect("parse");
        assert_eq!(schema.len(), 5);

        let owner = &schema["u_owner"];
        assert_eq!(owner.internal_type, "reference");
        assert_eq!(owner.reference_table.as_deref(), Some("u_dm_user"));
        assert_eq!(owner.max_length, Some(32));
        assert!(!owner.has_choice_list);
        assert!(schema["u_state"].has_choice_list);
    }

    #[test]
    fn test_parse_rejects_empty_schema() {
        let error = parse_schema_xml("u_dm_host", "<u_dm_host></u_dm_host>").expect_err("empty");
        assert!(matches!(error, GlideError::Schema(_)));
    }

    #[test]
    fn test_parse_rejects_nameless_element() {
        let xml = r#"<u_dm_host><element internal_type="string"/></u_dm_host>"#;
        assert!(parse_schema_xml("u_dm_host", xml).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let (transport, script) = scripted_transport();
        script.respond(Method::GET, "/u_dm_host.do", ScriptedResponse::xml(200, HOST_XML));

        let cache = Arc::new(SchemaCache::default());
        let transport = Arc::new(transport);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                cache.get("u_dm_host", &transport).await.expect("schema")
            }));
        }

        let mut schemas = Vec::new();
        for handle in handles {
            schemas.push(handle.await.expect("join"));
        }

        assert_eq!(script.call_count("/u_dm_host.do"), 1);
        for schema in &schemas[1..] {
            assert!(Arc::ptr_eq(&schemas[0], schema));
        }
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let (transport, script) = scripted_transport();
        script.respond(Method::GET, "/u_dm_host.do", ScriptedResponse::xml(200, HOST_XML));

        let cache = SchemaCache::default();
        cache.get("u_dm_host", &transport).await.expect("first");
        cache.get("u_dm_host", &transport).await.expect("cached");
        assert_eq!(script.call_count("/u_dm_host.do"), 1);

        cache.invalidate("u_dm_host");
        cache.get("u_dm_host", &transport).await.expect("refetched");
        assert_eq!(script.call_count("/u_dm_host.do"), 2);
    }

    #[tokio::test]
    async fn test_expiry_forces_refetch() {
        let (transport, script) = scripted_transport();
        script.respond(Method::GET, "/u_dm_host.do", ScriptedResponse::xml(200, HOST_XML));

        let cache = SchemaCache::new(Duration::from_millis(10));
        cache.get("u_dm_host", &transport).await.expect("first");
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.get("u_dm_host", &transport).await.expect("expired");
        assert_eq!(script.call_count("/u_dm_host.do"), 2);
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use portico_core::{
    Filter, GatewayError, GatewayResult, Mutation, MutationKind, QueryDescriptor, QueryOptions,
    Row,
};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{PocketbaseProvider, PROVIDER_NAME};
use crate::capability::{DbCapability, FunctionsCapability, ObjectPath, StorageCapability, UploadOptions};

/// Page size used when the caller gave no limit.
const DEFAULT_PER_PAGE: u32 = 500;

/// Multipart field that uploads are written to.
const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<Row>,
}

/// Request window for an offset/limit pair.
///
/// PocketBase pages instead of offsetting. When the offset is a multiple of the
/// limit the window maps onto one page exactly; otherwise one larger first
/// page is fetched and the head is skipped locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub page: u32,
    pub per_page: u32,
    pub skip: usize,
    pub take: Option<usize>,
}

/// `None` when the request can be answered without a round trip (limit 0).
pub fn page_window(offset: Option<u32>, limit: Option<u32>) -> Option<PageWindow> {
    let offset = offset.unwrap_or(0);
    match limit {
        Some(0) => None,
        Some(limit) if offset % limit == 0 => Some(PageWindow {
            page: offset / limit + 1,
            per_page: limit,
            skip: 0,
            take: Some(limit as usize),
        }),
        Some(limit) => Some(PageWindow {
            page: 1,
            per_page: offset.saturating_add(limit),
            skip: offset as usize,
            take: Some(limit as usize),
        }),
        None => Some(PageWindow {
            page: 1,
            per_page: offset.saturating_add(DEFAULT_PER_PAGE),
            skip: offset as usize,
            take: None,
        }),
    }
}

/// PocketBase filter syntax for an equality filter, e.g. `(done=false && owner='u1')`.
pub fn filter_expression(filter: &Filter) -> Option<String> {
    if filter.is_empty() {
        return None;
    }
    let clauses: Vec<String> = filter
        .iter()
        .map(|(column, value)| format!("{}={}", column, literal(value)))
        .collect();
    Some(format!("({})", clauses.join(" && ")))
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        other => quote(&other.to_string()),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn list_params(options: &QueryOptions, window: &PageWindow) -> Vec<(String, String)> {
    let mut params = vec![
        ("page".to_string(), window.page.to_string()),
        ("perPage".to_string(), window.per_page.to_string()),
        ("skipTotal".to_string(), "1".to_string()),
    ];
    if let Some(filter) = filter_expression(&options.filter) {
        params.push(("filter".to_string(), filter));
    }
    if let Some(order) = &options.order {
        let sort = if order.ascending {
            order.column.clone()
        } else {
            format!("-{}", order.column)
        };
        params.push(("sort".to_string(), sort));
    }
    params
}

fn record_id(row: &Row) -> GatewayResult<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::invalid_response(PROVIDER_NAME, "record without an id"))
}

impl PocketbaseProvider {
    fn records_url(&self, collection: &str) -> String {
        self.http
            .url(&format!("/api/collections/{}/records", urlencoding::encode(collection)))
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.records_url(collection), urlencoding::encode(id))
    }

    async fn list(
        &self,
        collection: &str,
        options: &QueryOptions,
        window: &PageWindow,
    ) -> GatewayResult<Vec<Row>> {
        let request = self
            .authorize(self.http.client().get(self.records_url(collection)))
            .query(&list_params(options, window));
        let response: ListResponse = self.http.send_json(request).await?;
        Ok(response.items)
    }

    /// Every record matching `filter`, following pages until a short one.
    async fn list_matching(&self, collection: &str, filter: &Filter) -> GatewayResult<Vec<Row>> {
        let options = QueryOptions {
            filter: filter.clone(),
            ..QueryOptions::default()
        };
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let window = PageWindow {
                page,
                per_page: DEFAULT_PER_PAGE,
                skip: 0,
                take: None,
            };
            let items = self.list(collection, &options, &window).await?;
            let done = items.len() < DEFAULT_PER_PAGE as usize;
            rows.extend(items);
            if done {
                return Ok(rows);
            }
            page += 1;
        }
    }

    async fn create(&self, collection: &str, row: &Row) -> GatewayResult<Row> {
        let request = self
            .authorize(self.http.client().post(self.records_url(collection)))
            .json(row);
        self.http.send_json(request).await
    }

    async fn patch(&self, collection: &str, id: &str, values: &Value) -> GatewayResult<Row> {
        let request = self
            .authorize(self.http.client().patch(self.record_url(collection, id)))
            .json(values);
        self.http.send_json(request).await
    }

    async fn upsert(&self, collection: &str, row: &Row) -> GatewayResult<Row> {
        let Some(id) = row.get("id").and_then(Value::as_str) else {
            return self.create(collection, row).await;
        };
        match self.patch(collection, id, row).await {
            Err(GatewayError::Http { status: 404, .. }) => self.create(collection, row).await,
            other => other,
        }
    }

    /// Split `recordId/filename` from an object path.
    fn file_target(object_path: &str) -> GatewayResult<(&str, &str)> {
        match object_path.split_once('/') {
            Some((record, file)) if !file.contains('/') => Ok((record, file)),
            _ => Err(GatewayError::unsupported(
                PROVIDER_NAME,
                "object paths other than '<record id>/<file name>'",
            )),
        }
    }
}

#[async_trait]
impl DbCapability for PocketbaseProvider {
    async fn query(&self, query: &QueryDescriptor) -> GatewayResult<Vec<Row>> {
        let options = query.options();
        let Some(window) = page_window(options.offset, options.limit) else {
            return Ok(Vec::new());
        };
        let items = self.list(query.table().as_str(), options, &window).await?;
        let rows = items.into_iter().skip(window.skip);
        Ok(match window.take {
            Some(take) => rows.take(take).collect(),
            None => rows.collect(),
        })
    }

    async fn mutate(&self, mutation: &Mutation) -> GatewayResult<Vec<Row>> {
        let collection = mutation.table().as_str();
        let mut affected = Vec::new();
        match mutation.kind() {
            MutationKind::Insert { rows } => {
                for row in rows {
                    affected.push(self.create(collection, row).await?);
                }
            }
            MutationKind::Upsert { rows } => {
                for row in rows {
                    affected.push(self.upsert(collection, row).await?);
                }
            }
            MutationKind::Update { filter, values } => {
                let values = Value::Object(values.clone());
                for row in self.list_matching(collection, filter).await? {
                    let id = record_id(&row)?;
                    affected.push(self.patch(collection, &id, &values).await?);
                }
            }
            MutationKind::Delete { filter } => {
                for row in self.list_matching(collection, filter).await? {
                    let id = record_id(&row)?;
                    let request = self
                        .authorize(self.http.client().delete(self.record_url(collection, &id)));
                    self.http.send_empty(request).await?;
                    affected.push(row);
                }
            }
        }
        Ok(affected)
    }
}

#[async_trait]
impl StorageCapability for PocketbaseProvider {
    async fn upload(
        &self,
        object: &ObjectPath,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> GatewayResult<String> {
        let (record, file_name) = Self::file_target(object.path())?;
        let mut part = Part::bytes(bytes).file_name(file_name.to_string());
        if let Some(content_type) = &options.content_type {
            part = part
                .mime_str(content_type)
                .map_err(|e| GatewayError::transport(PROVIDER_NAME, e.to_string()))?;
        }
        let form = Form::new().part(FILE_FIELD, part);
        let request = self
            .authorize(self.http.client().patch(self.record_url(object.bucket(), record)))
            .multipart(form);
        self.http.send_empty(request).await?;
        Ok(self.public_url(object))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> GatewayResult<()> {
        let mut by_record: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for path in paths {
            let (record, file_name) = Self::file_target(path)?;
            by_record.entry(record).or_default().push(file_name);
        }
        for (record, file_names) in by_record {
            let mut body = serde_json::Map::new();
            body.insert(format!("{}-", FILE_FIELD), json!(file_names));
            let request = self
                .authorize(self.http.client().patch(self.record_url(bucket, record)))
                .json(&body);
            self.http.send_empty(request).await?;
        }
        Ok(())
    }

    fn public_url(&self, object: &ObjectPath) -> String {
        let encoded: Vec<String> = object
            .path()
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        self.http.url(&format!(
            "/api/files/{}/{}",
            urlencoding::encode(object.bucket()),
            encoded.join("/")
        ))
    }
}

#[async_trait]
impl FunctionsCapability for PocketbaseProvider {
    async fn invoke(&self, name: &str, body: Option<Value>) -> GatewayResult<Value> {
        let path = name.trim_start_matches('/');
        let mut request = self.authorize(self.http.client().post(self.http.url(&format!("/api/{}", path))));
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.http.send_value(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_filter_expression() {
        let mut filter = Filter::new();
        filter.insert("done".to_string(), json!(false));
        filter.insert("owner".to_string(), json!("o'neil"));
        filter.insert("parent".to_string(), Value::Null);
        assert_eq!(
            filter_expression(&filter).unwrap(),
            "(done=false && owner='o\\'neil' && parent=null)"
        );
        assert!(filter_expression(&Filter::new()).is_none());
    }

    #[test]
    fn test_list_params_sort() {
        let options = QueryOptions::new().order_by("created", false);
        let window = page_window(None, None).unwrap();
        let params = list_params(&options, &window);
        assert!(params.contains(&("sort".to_string(), "-created".to_string())));
        assert!(params.contains(&("perPage".to_string(), "500".to_string())));
    }

    #[test]
    fn test_page_window_aligned_and_unaligned() {
        assert_eq!(
            page_window(Some(20), Some(10)),
            Some(PageWindow { page: 3, per_page: 10, skip: 0, take: Some(10) })
        );
        assert_eq!(
            page_window(Some(5), Some(10)),
            Some(PageWindow { page: 1, per_page: 15, skip: 5, take: Some(10) })
        );
        assert_eq!(page_window(Some(5), Some(0)), None);
    }

    #[test]
    fn test_file_target() {
        assert_eq!(PocketbaseProvider::file_target("rec1/a.png").unwrap(), ("rec1", "a.png"));
        assert!(PocketbaseProvider::file_target("a.png").is_err());
        assert!(PocketbaseProvider::file_target("a/b/c.png").is_err());
    }

    proptest! {
        /// The window always covers exactly rows [offset, offset + limit).
        #[test]
        fn page_window_covers_requested_rows(offset in 0u32..1000, limit in 1u32..200) {
            let window = page_window(Some(offset), Some(limit)).unwrap();
            let first = (window.page - 1) as u64 * window.per_page as u64 + window.skip as u64;
            prop_assert_eq!(first, offset as u64);
            let available = window.per_page as usize - window.skip;
            prop_assert!(available >= limit as usize);
        }
    }
}

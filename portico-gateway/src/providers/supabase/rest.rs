use async_trait::async_trait;
use portico_core::{
    Filter, GatewayResult, Mutation, MutationKind, QueryDescriptor, QueryOptions, Row,
};
use serde_json::{json, Value};

use super::SupabaseProvider;
use crate::capability::{DbCapability, FunctionsCapability, ObjectPath, StorageCapability, UploadOptions};

const RETURN_REPRESENTATION: &str = "return=representation";
const UPSERT_PREFERENCE: &str = "return=representation,resolution=merge-duplicates";

/// PostgREST query parameters for a read.
pub fn postgrest_params(options: &QueryOptions) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(filter_params(&options.filter));
    if let Some(order) = &options.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    if let Some(limit) = options.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = options.offset {
        params.push(("offset".to_string(), offset.to_string()));
    }
    params
}

fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .iter()
        .map(|(column, value)| (column.clone(), filter_operand(value)))
        .collect()
}

fn filter_operand(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::Bool(b) => format!("is.{}", b),
        Value::String(s) => format!("eq.{}", s),
        Value::Number(n) => format!("eq.{}", n),
        other => format!("eq.{}", other),
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl DbCapability for SupabaseProvider {
    async fn query(&self, query: &QueryDescriptor) -> GatewayResult<Vec<Row>> {
        let url = self.http.url(&format!("/rest/v1/{}", query.table()));
        let request = self
            .authorize(self.http.client().get(url))
            .query(&postgrest_params(query.options()));
        self.http.send_json(request).await
    }

    async fn mutate(&self, mutation: &Mutation) -> GatewayResult<Vec<Row>> {
        let url = self.http.url(&format!("/rest/v1/{}", mutation.table()));
        let client = self.http.client();
        let request = match mutation.kind() {
            MutationKind::Insert { rows } => client
                .post(url)
                .header("Prefer", RETURN_REPRESENTATION)
                .json(rows),
            MutationKind::Upsert { rows } => client
                .post(url)
                .header("Prefer", UPSERT_PREFERENCE)
                .json(rows),
            MutationKind::Update { filter, values } => client
                .patch(url)
                .header("Prefer", RETURN_REPRESENTATION)
                .query(&filter_params(filter))
                .json(values),
            MutationKind::Delete { filter } => client
                .delete(url)
                .header("Prefer", RETURN_REPRESENTATION)
                .query(&filter_params(filter)),
        };
        self.http.send_json(self.authorize(request)).await
    }
}

#[async_trait]
impl StorageCapability for SupabaseProvider {
    async fn upload(
        &self,
        object: &ObjectPath,
        bytes: Vec<u8>,
        options: &UploadOptions,
    ) -> GatewayResult<String> {
        let url = self.http.url(&format!(
            "/storage/v1/object/{}/{}",
            urlencoding::encode(object.bucket()),
            encode_path(object.path())
        ));
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let request = self
            .authorize(self.http.client().post(url))
            .header("content-type", content_type)
            .header("x-upsert", if options.upsert { "true" } else { "false" })
            .body(bytes);
        self.http.send_empty(request).await?;
        Ok(self.public_url(object))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> GatewayResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let url = self
            .http
            .url(&format!("/storage/v1/object/{}", urlencoding::encode(bucket)));
        let request = self
            .authorize(self.http.client().delete(url))
            .json(&json!({ "prefixes": paths }));
        self.http.send_empty(request).await
    }

    fn public_url(&self, object: &ObjectPath) -> String {
        self.http.url(&format!(
            "/storage/v1/object/public/{}/{}",
            urlencoding::encode(object.bucket()),
            encode_path(object.path())
        ))
    }
}

#[async_trait]
impl FunctionsCapability for SupabaseProvider {
    async fn invoke(&self, name: &str, body: Option<Value>) -> GatewayResult<Value> {
        let url = self
            .http
            .url(&format!("/functions/v1/{}", urlencoding::encode(name)));
        let mut request = self.authorize(self.http.client().post(url));
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.http.send_value(request).await
    }
}

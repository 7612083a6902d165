//! Neo4j graph store client over the HTTP transactional endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::graph::{validate_identifier, GraphStore, Properties};

pub struct Neo4jGraphStore {
    client: Client,
    base_url: String,
    database: String,
    user: String,
    password: String,
    merge: bool,
}

impl Neo4jGraphStore {
    pub fn new(
        base_url: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
            merge: false,
        }
    }

    /// Use MERGE instead of CREATE so repeated writes converge
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    async fn run(&self, statement: String, parameters: Value) -> Result<()> {
        let url = format!("{}/db/{}/tx/commit", self.base_url, self.database);
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": parameters
            }]
        });

        debug!("Cypher: {}", statement);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::from_response(response).await);
        }

        let reply: CypherReply = response.json().await?;
        if let Some(error) = reply.errors.first() {
            return Err(StoreError::Rejected(format!("{}: {}", error.code, error.message)));
        }

        Ok(())
    }
}

pub(crate) fn node_statement(label: &str, properties: &Properties, merge: bool) -> Result<String> {
    let label = validate_identifier(label)?;
    for key in properties.keys() {
        validate_identifier(key)?;
    }

    if merge && properties.contains_key("id") {
        Ok(format!("MERGE (n:`{}` {{id: $props.id}}) SET n += $props", label))
    } else {
        Ok(format!("CREATE (n:`{}`) SET n = $props", label))
    }
}

pub(crate) fn relationship_statement(
    from_label: &str,
    from_match: &Properties,
    relation_type: &str,
    to_label: &str,
    to_match: &Properties,
    merge: bool,
) -> Result<String> {
    let from_label = validate_identifier(from_label)?;
    let relation_type = validate_identifier(relation_type)?;
    let to_label = validate_identifier(to_label)?;

    let mut conditions = Vec::new();
    for key in from_match.keys() {
        let key = validate_identifier(key)?;
        conditions.push(format!("a.`{key}` = $from_props.`{key}`"));
    }
    for key in to_match.keys() {
        let key = validate_identifier(key)?;
        conditions.push(format!("b.`{key}` = $to_props.`{key}`"));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let verb = if merge { "MERGE" } else { "CREATE" };

    Ok(format!(
        "MATCH (a:`{}`), (b:`{}`){} {} (a)-[:`{}`]->(b)",
        from_label, to_label, where_clause, verb, relation_type
    ))
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn create_node(&self, label: &str, properties: Properties) -> Result<()> {
        let statement = node_statement(label, &properties, self.merge)?;
        self.run(statement, json!({ "props": properties })).await
    }

    async fn merge_node(&self, label: &str, properties: Properties) -> Result<()> {
        let statement = node_statement(label, &properties, true)?;
        self.run(statement, json!({ "props": properties })).await
    }

    async fn create_relationship(
        &self,
        from_label: &str,
        from_match: Properties,
        relation_type: &str,
        to_label: &str,
        to_match: Properties,
    ) -> Result<()> {
        let statement = relationship_statement(
            from_label,
            &from_match,
            relation_type,
            to_label,
            &to_match,
            self.merge,
        )?;
        self.run(
            statement,
            json!({ "from_props": from_match, "to_props": to_match }),
        )
        .await
    }
}

// Response structures
#[derive(Debug, Deserialize)]
struct CypherReply {
    #[serde(default)]
    errors: Vec<CypherError>,
}

#[derive(Debug, Deserialize)]
struct CypherError {
    code: String,
    message: String,
}

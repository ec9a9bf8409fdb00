//! Kanban gateway backed by GitHub Projects V2 (GraphQL).
//!
//! The core speaks four column names (`queue`, `in_progress`, `done`,
//! `failed`) and the gateway maps them to the board's display names. Board
//! metadata (project node id, Status field id, column option ids) is fetched
//! once and cached.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::errors::KanbanError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// An external work item. Opaque to the core beyond these fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// List/move/close tickets on an external board.
#[async_trait]
pub trait TicketBoard: Send + Sync {
    async fn list_tickets(&self, column: &str) -> Result<Vec<Ticket>, KanbanError>;
    async fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, KanbanError>;
    async fn move_ticket(&self, ticket_id: &str, column: &str) -> Result<(), KanbanError>;
    async fn close_ticket(&self, ticket_id: &str) -> Result<(), KanbanError>;
}

/// Map an internal column name to the board's display name. Unknown names
/// pass through so custom columns still work.
fn provider_column(column: &str) -> &str {
    match column {
        "queue" | "todo" => "Todo",
        "in_progress" => "In Progress",
        "done" => "Done",
        "failed" => "Failed",
        other => other,
    }
}

#[derive(Debug, Clone)]
struct BoardMeta {
    project_node_id: String,
    status_field_id: String,
    /// Column display name -> single-select option id.
    column_options: HashMap<String, String>,
}

impl BoardMeta {
    fn from_project_node(node: &Value) -> Result<Self, KanbanError> {
        let project_node_id = node
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| KanbanError::Api("project node has no id".into()))?
            .to_string();
        let field = node
            .get("field")
            .filter(|f| !f.is_null())
            .ok_or_else(|| KanbanError::Api("Status field not found on board".into()))?;
        let status_field_id = field
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| KanbanError::Api("Status field has no id".into()))?
            .to_string();
        let mut column_options = HashMap::new();
        if let Some(options) = field.get("options").and_then(Value::as_array) {
            for opt in options {
                if let (Some(name), Some(id)) = (
                    opt.get("name").and_then(Value::as_str),
                    opt.get("id").and_then(Value::as_str),
                ) {
                    column_options.insert(name.to_string(), id.to_string());
                }
            }
        }
        Ok(Self {
            project_node_id,
            status_field_id,
            column_options,
        })
    }
}

/// Extract tickets from a project items payload, keeping only the requested
/// column. Items without content (draft cards) are skipped.
fn tickets_from_items(items: &[Value], column_display_name: &str) -> Vec<Ticket> {
    let mut tickets = Vec::new();
    for item in items {
        let status = item
            .pointer("/fieldValueByName/name")
            .and_then(Value::as_str);
        if status != Some(column_display_name) {
            continue;
        }
        let Some(content) = item.get("content").filter(|c| !c.is_null()) else {
            continue;
        };
        let Some(number) = content.get("number").and_then(Value::as_i64) else {
            continue;
        };
        let labels = content
            .pointer("/labels/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        tickets.push(Ticket {
            id: number.to_string(),
            title: content
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            body: content
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            labels,
        });
    }
    tickets
}

const PROJECT_FIELDS_FRAGMENT: &str = r#"
    projectV2(number: $projectNumber) {
        id
        field(name: "Status") {
            ... on ProjectV2SingleSelectField {
                id
                options {
                    id
                    name
                }
            }
        }
    }"#;

const ITEMS_QUERY: &str = r#"
query($projectId: ID!) {
    node(id: $projectId) {
        ... on ProjectV2 {
            items(first: 100) {
                nodes {
                    id
                    fieldValueByName(name: "Status") {
                        ... on ProjectV2ItemFieldSingleSelectValue {
                            name
                        }
                    }
                    content {
                        ... on Issue {
                            number
                            title
                            body
                            labels(first: 10) {
                                nodes {
                                    name
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}"#;

const ISSUE_QUERY: &str = r#"
query($owner: String!, $repo: String!, $number: Int!) {
    repository(owner: $owner, name: $repo) {
        issue(number: $number) {
            id
            number
            title
            body
            labels(first: 10) {
                nodes {
                    name
                }
            }
        }
    }
}"#;

const MOVE_MUTATION: &str = r#"
mutation($projectId: ID!, $itemId: ID!, $fieldId: ID!, $optionId: String!) {
    updateProjectV2ItemFieldValue(
        input: {
            projectId: $projectId
            itemId: $itemId
            fieldId: $fieldId
            value: { singleSelectOptionId: $optionId }
        }
    ) {
        projectV2Item {
            id
        }
    }
}"#;

const CLOSE_MUTATION: &str = r#"
mutation($issueId: ID!) {
    closeIssue(input: { issueId: $issueId }) {
        issue {
            id
            state
        }
    }
}"#;

pub struct GitHubProjectsBoard {
    owner: String,
    repo_name: String,
    board_number: i64,
    token: String,
    graphql_url: String,
    client: reqwest::Client,
    meta: Mutex<Option<BoardMeta>>,
}

impl GitHubProjectsBoard {
    pub fn new(repo: &str, board_number: i64, token: &str) -> Self {
        Self::with_graphql_url(repo, board_number, token, "https://api.github.com/graphql")
    }

    pub fn with_graphql_url(repo: &str, board_number: i64, token: &str, url: &str) -> Self {
        let (owner, repo_name) = repo.split_once('/').unwrap_or((repo, ""));
        Self {
            owner: owner.to_string(),
            repo_name: repo_name.to_string(),
            board_number,
            token: token.to_string(),
            graphql_url: url.to_string(),
            client: reqwest::Client::new(),
            meta: Mutex::new(None),
        }
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, KanbanError> {
        let resp = self
            .client
            .post(&self.graphql_url)
            .timeout(HTTP_TIMEOUT)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "vibecc")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(KanbanError::Api(format!(
                "GraphQL request failed: {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(KanbanError::Api(format!("GraphQL errors: {errors}")));
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| KanbanError::Api("GraphQL response has no data".into()))
    }

    /// Fetch and cache the board metadata. A user-level board is tried
    /// first, then a repository-level one.
    async fn board_meta(&self) -> Result<BoardMeta, KanbanError> {
        let mut cached = self.meta.lock().await;
        if let Some(meta) = cached.as_ref() {
            return Ok(meta.clone());
        }

        let user_query = format!(
            "query($owner: String!, $projectNumber: Int!) {{ user(login: $owner) {{{PROJECT_FIELDS_FRAGMENT} }} }}"
        );
        let repo_query = format!(
            "query($owner: String!, $repo: String!, $projectNumber: Int!) {{ repository(owner: $owner, name: $repo) {{{PROJECT_FIELDS_FRAGMENT} }} }}"
        );

        let node = match self
            .graphql(
                &user_query,
                json!({ "owner": self.owner, "projectNumber": self.board_number }),
            )
            .await
        {
            Ok(data) => data.pointer("/user/projectV2").filter(|n| !n.is_null()).cloned(),
            Err(_) => None,
        };
        let node = match node {
            Some(node) => Some(node),
            None => self
                .graphql(
                    &repo_query,
                    json!({
                        "owner": self.owner,
                        "repo": self.repo_name,
                        "projectNumber": self.board_number,
                    }),
                )
                .await?
                .pointer("/repository/projectV2")
                .filter(|n| !n.is_null())
                .cloned(),
        };

        let node = node.ok_or_else(|| {
            KanbanError::BoardNotFound(format!(
                "board #{} not found for user {} or repo {}/{}",
                self.board_number, self.owner, self.owner, self.repo_name
            ))
        })?;
        let meta = BoardMeta::from_project_node(&node)?;
        *cached = Some(meta.clone());
        Ok(meta)
    }

    async fn project_items(&self, meta: &BoardMeta) -> Result<Vec<Value>, KanbanError> {
        let data = self
            .graphql(ITEMS_QUERY, json!({ "projectId": meta.project_node_id }))
            .await?;
        Ok(data
            .pointer("/node/items/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Find the project item backing an issue number.
    async fn project_item_id(&self, meta: &BoardMeta, ticket_id: &str) -> Result<String, KanbanError> {
        let items = self.project_items(meta).await?;
        for item in &items {
            let number = item.pointer("/content/number").and_then(Value::as_i64);
            if number.map(|n| n.to_string()).as_deref() == Some(ticket_id) {
                if let Some(id) = item.get("id").and_then(Value::as_str) {
                    return Ok(id.to_string());
                }
            }
        }
        Err(KanbanError::TicketNotFound(ticket_id.to_string()))
    }

    async fn issue_node(&self, ticket_id: &str) -> Result<Value, KanbanError> {
        let number: i64 = ticket_id
            .parse()
            .map_err(|_| KanbanError::TicketNotFound(ticket_id.to_string()))?;
        let data = self
            .graphql(
                ISSUE_QUERY,
                json!({ "owner": self.owner, "repo": self.repo_name, "number": number }),
            )
            .await?;
        data.pointer("/repository/issue")
            .filter(|issue| !issue.is_null())
            .cloned()
            .ok_or_else(|| KanbanError::TicketNotFound(ticket_id.to_string()))
    }
}

#[async_trait]
impl TicketBoard for GitHubProjectsBoard {
    async fn list_tickets(&self, column: &str) -> Result<Vec<Ticket>, KanbanError> {
        let meta = self.board_meta().await?;
        let items = self.project_items(&meta).await?;
        let tickets = tickets_from_items(&items, provider_column(column));
        tracing::debug!(column, count = tickets.len(), "listed kanban tickets");
        Ok(tickets)
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, KanbanError> {
        let issue = self.issue_node(ticket_id).await?;
        let labels = issue
            .pointer("/labels/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Ticket {
            id: ticket_id.to_string(),
            title: issue
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            body: issue
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            labels,
        })
    }

    async fn move_ticket(&self, ticket_id: &str, column: &str) -> Result<(), KanbanError> {
        let meta = self.board_meta().await?;
        let display = provider_column(column);
        let option_id = meta
            .column_options
            .get(display)
            .ok_or_else(|| KanbanError::ColumnNotFound(column.to_string()))?
            .clone();
        let item_id = self.project_item_id(&meta, ticket_id).await?;

        self.graphql(
            MOVE_MUTATION,
            json!({
                "projectId": meta.project_node_id,
                "itemId": item_id,
                "fieldId": meta.status_field_id,
                "optionId": option_id,
            }),
        )
        .await?;
        tracing::info!(ticket_id, column, "moved ticket");
        Ok(())
    }

    async fn close_ticket(&self, ticket_id: &str) -> Result<(), KanbanError> {
        let issue = self.issue_node(ticket_id).await?;
        let issue_id = issue
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| KanbanError::TicketNotFound(ticket_id.to_string()))?;

        self.graphql(CLOSE_MUTATION, json!({ "issueId": issue_id })).await?;
        tracing::info!(ticket_id, "closed ticket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_column_mapping() {
        assert_eq!(provider_column("queue"), "Todo");
        assert_eq!(provider_column("todo"), "Todo");
        assert_eq!(provider_column("in_progress"), "In Progress");
        assert_eq!(provider_column("done"), "Done");
        assert_eq!(provider_column("failed"), "Failed");
        // Unknown names pass through unchanged.
        assert_eq!(provider_column("Blocked"), "Blocked");
    }

    fn item(number: i64, title: &str, status: Option<&str>, labels: &[&str]) -> Value {
        let label_nodes: Vec<Value> = labels.iter().map(|l| json!({ "name": l })).collect();
        json!({
            "id": format!("ITEM_{number}"),
            "fieldValueByName": status.map(|s| json!({ "name": s })),
            "content": {
                "number": number,
                "title": title,
                "body": format!("body of {number}"),
                "labels": { "nodes": label_nodes }
            }
        })
    }

    #[test]
    fn test_tickets_from_items_filters_by_column() {
        let items = vec![
            item(1, "In queue", Some("Todo"), &["bug"]),
            item(2, "Working", Some("In Progress"), &[]),
            item(3, "Also queued", Some("Todo"), &[]),
        ];
        let tickets = tickets_from_items(&items, "Todo");
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].id, "1");
        assert_eq!(tickets[0].title, "In queue");
        assert_eq!(tickets[0].labels, vec!["bug".to_string()]);
        assert_eq!(tickets[1].id, "3");
    }

    #[test]
    fn test_tickets_from_items_skips_unstatused_and_draft_items() {
        let items = vec![
            item(1, "No status", None, &[]),
            json!({ "id": "ITEM_X", "fieldValueByName": { "name": "Todo" }, "content": null }),
            item(2, "Real", Some("Todo"), &[]),
        ];
        let tickets = tickets_from_items(&items, "Todo");
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].id, "2");
    }

    #[test]
    fn test_tickets_from_items_empty_board() {
        assert!(tickets_from_items(&[], "Todo").is_empty());
    }

    #[test]
    fn test_board_meta_from_project_node() {
        let node = json!({
            "id": "PVT_1",
            "field": {
                "id": "FIELD_1",
                "options": [
                    { "id": "OPT_A", "name": "Todo" },
                    { "id": "OPT_B", "name": "In Progress" },
                    { "id": "OPT_C", "name": "Done" }
                ]
            }
        });
        let meta = BoardMeta::from_project_node(&node).unwrap();
        assert_eq!(meta.project_node_id, "PVT_1");
        assert_eq!(meta.status_field_id, "FIELD_1");
        assert_eq!(meta.column_options.get("Todo").map(String::as_str), Some("OPT_A"));
        assert_eq!(meta.column_options.len(), 3);
    }

    #[test]
    fn test_board_meta_requires_status_field() {
        let node = json!({ "id": "PVT_1", "field": null });
        assert!(matches!(
            BoardMeta::from_project_node(&node),
            Err(KanbanError::Api(_))
        ));
    }

    #[test]
    fn test_ticket_serde_round_trip() {
        let ticket = Ticket {
            id: "42".to_string(),
            title: "Add login".to_string(),
            body: "Implement login".to_string(),
            labels: vec!["feature".to_string()],
        };
        let json = serde_json::to_string(&ticket).unwrap();
        let back: Ticket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ticket);
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use super::{StoreError, StoreResult, TaskStore};
use crate::graph::{Edge, Graph, Vertex};
use crate::types::TaskData;

const SELECT_TASK: &str = "SELECT task_template_id, graph_id FROM tasks WHERE id = $1";
const SELECT_SOLVER_ID: &str = "SELECT task_solver_id FROM tasktemplates WHERE id = $1";
const SELECT_SCRIPT: &str = "SELECT execution_descriptor FROM tasksolvers WHERE id = $1";
const SELECT_GRAPH: &str = "SELECT id, label FROM graphs WHERE id = $1";
const SELECT_VERTICES: &str = "SELECT v.id, v.label, v.x, v.y \
     FROM graphs_vertices AS gv INNER JOIN vertices AS v ON v.id = gv.vertices_id \
     WHERE gv.graph_entity_id = $1";
const SELECT_EDGES: &str = "SELECT e.v1_id, e.v2_id, e.label \
     FROM graphs_edges AS ge INNER JOIN edges AS e ON e.id = ge.edges_id \
     WHERE ge.graph_entity_id = $1";
const UPDATE_RESULT: &str =
    "UPDATE taskresults SET answer_true = $1, evaluation_date = $2 WHERE id = $3";

/// [`TaskStore`] over the application's Postgres schema.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!("connection to database established");
        Ok(Self { pool })
    }

    async fn script(&self, task_template_id: i64) -> StoreResult<Option<String>> {
        let Some((solver_id,)) = sqlx::query_as::<_, (i64,)>(SELECT_SOLVER_ID)
            .bind(task_template_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            warn!(task_template_id, "task template not found");
            return Ok(None);
        };

        let script = sqlx::query_as::<_, (String,)>(SELECT_SCRIPT)
            .bind(solver_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|(script,)| script);
        if script.is_none() {
            warn!(task_solver_id = solver_id, "task solver not found");
        }
        Ok(script)
    }

    async fn graph(&self, graph_id: i64) -> StoreResult<Option<Graph>> {
        let Some((id, label)) = sqlx::query_as::<_, (i64, Option<String>)>(SELECT_GRAPH)
            .bind(graph_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            warn!(graph_id, "graph not found");
            return Ok(None);
        };

        let vertex_rows = sqlx::query_as::<_, (i64, Option<String>, i32, i32)>(SELECT_VERTICES)
            .bind(graph_id)
            .fetch_all(&self.pool)
            .await?;
        let edge_rows = sqlx::query_as::<_, (i64, i64, Option<String>)>(SELECT_EDGES)
            .bind(graph_id)
            .fetch_all(&self.pool)
            .await?;

        let vertices: Vec<Vertex> = vertex_rows
            .into_iter()
            .map(|(id, label, x, y)| Vertex {
                id,
                label: label.unwrap_or_default(),
                x,
                y,
            })
            .collect();
        let edges = assemble_edges(graph_id, &vertices, edge_rows)?;

        Ok(Some(Graph {
            id,
            edges,
            vertices,
            label: label.unwrap_or_default(),
        }))
    }
}

/// Resolve `(v1_id, v2_id, label)` rows against the graph's vertices.
fn assemble_edges(
    graph_id: i64,
    vertices: &[Vertex],
    rows: Vec<(i64, i64, Option<String>)>,
) -> StoreResult<Vec<Edge>> {
    let by_id: HashMap<i64, &Vertex> = vertices.iter().map(|v| (v.id, v)).collect();
    let lookup = |id: i64| {
        by_id.get(&id).map(|v| (*v).clone()).ok_or_else(|| {
            StoreError::Corrupt(format!("graph {graph_id}: edge references unknown vertex {id}"))
        })
    };

    rows.into_iter()
        .map(|(v1, v2, label)| -> StoreResult<Edge> {
            Ok(Edge {
                source_vertex: lookup(v1)?,
                target_vertex: lookup(v2)?,
                label: label.unwrap_or_default(),
            })
        })
        .collect()
}

#[async_trait]
impl TaskStore for PgStore {
    async fn fetch_task(&self, task_id: i64) -> StoreResult<Option<TaskData>> {
        let Some((task_template_id, graph_id)) = sqlx::query_as::<_, (i64, i64)>(SELECT_TASK)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            warn!(task_id, "task not found");
            return Ok(None);
        };

        let Some(script) = self.script(task_template_id).await? else {
            return Ok(None);
        };
        let Some(graph) = self.graph(graph_id).await? else {
            return Ok(None);
        };
        Ok(Some(TaskData { script, graph }))
    }

    async fn record_outcome(
        &self,
        request_id: i64,
        is_correct: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(UPDATE_RESULT)
            .bind(is_correct)
            .bind(at)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(request_id, "no task result row to update");
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};

/// A task graph as handed to evaluation scripts.
///
/// Field order is part of the wire format the scripts parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: i64,
    pub edges: Vec<Edge>,
    pub vertices: Vec<Vertex>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: i64,
    pub label: String,
    pub x: i32,
    pub y: i32,
}

/// Edges embed both endpoint vertices rather than referencing them by ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source_vertex: Vertex,
    pub target_vertex: Vertex,
    pub label: String,
}

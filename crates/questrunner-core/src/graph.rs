//! `TaskGraph` — lowers a [`Collection`] into a DAG of typed nodes and
//! edges.

use crate::error::{Error, Result};
use crate::model::{Collection, FolderItem, Item, RequestItem};
use questrunner_plugin::AuthSpec;
use std::collections::{HashMap, HashSet, VecDeque};

/// What kind of scheduling unit a [`TaskNode`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A collection- or folder-level script (`collection-pre`,
    /// `collection-post`, `folder-pre`, `folder-post`).
    Script,
    /// A leaf request, with inherited scripts attached as metadata.
    Request,
    /// The entry boundary of a folder subtree.
    FolderEnter,
    /// The exit boundary of a folder subtree.
    FolderExit,
}

/// Which script slot a [`NodeKind::Script`] node fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    /// `collection-pre`.
    CollectionPre,
    /// `collection-post`.
    CollectionPost,
    /// `folder-pre`.
    FolderPre,
    /// `folder-post`.
    FolderPost,
}

impl ScriptType {
    /// The `scriptType` string used in `ValidationError`/`TestResult`.
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::CollectionPre => "collection-pre",
            ScriptType::CollectionPost => "collection-post",
            ScriptType::FolderPre => "folder-pre",
            ScriptType::FolderPost => "folder-post",
        }
    }
}

/// One scheduled unit of work.
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Unique id within the graph.
    pub id: String,
    /// What kind of node this is.
    pub kind: NodeKind,
    /// Dot-joined path of item ids from the collection root.
    pub path: String,
    /// The enclosing folder's node-id prefix, if any (`None` at the top
    /// level).
    pub parent_folder_path: Option<String>,
    /// Populated for [`NodeKind::Script`] nodes.
    pub script_type: Option<ScriptType>,
    /// The script source, for script nodes.
    pub script: Option<String>,
    /// The skip condition expression, for request nodes and folder-enter
    /// nodes.
    pub condition: Option<String>,
    /// Outer→innermost inherited pre-request scripts, request nodes only.
    pub inherited_pre_scripts: Vec<String>,
    /// Innermost→outer inherited post-request scripts, request nodes only.
    pub inherited_post_scripts: Vec<String>,
    /// The nearest non-inherit ancestor auth, request/folder-enter nodes.
    pub effective_auth: Option<AuthSpec>,
    /// The request item, for request nodes.
    pub request: Option<RequestItem>,
    /// Every node id strictly inside this folder's subtree plus its
    /// `folder-exit`, in build order — used by
    /// [`TaskGraph::skip_subtree`] to fast-forward past a
    /// condition-false folder without executing its children.
    pub subtree_node_ids: Vec<String>,
}

impl TaskNode {
    fn new(id: impl Into<String>, kind: NodeKind, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            path: path.into(),
            parent_folder_path: None,
            script_type: None,
            script: None,
            condition: None,
            inherited_pre_scripts: Vec::new(),
            inherited_post_scripts: Vec::new(),
            effective_auth: None,
            request: None,
            subtree_node_ids: Vec::new(),
        }
    }
}

/// What kind of ordering constraint a [`TaskEdge`] expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Implied by tree structure / declaration order.
    Structural,
    /// Explicit `dependsOn` item-id reference.
    DependsOn,
    /// A plugin-event script ordering constraint (reserved; plugin events
    /// are not materialized as separate DAG nodes in this implementation,
    /// below).
    Event,
}

/// One ordering constraint between two nodes.
#[derive(Debug, Clone)]
pub struct TaskEdge {
    /// The upstream node id.
    pub from: String,
    /// The downstream node id.
    pub to: String,
    /// Why this edge exists.
    pub kind: EdgeKind,
}

/// The lowered DAG for one collection.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Every node, by id.
    pub nodes: HashMap<String, TaskNode>,
    /// Every edge.
    pub edges: Vec<TaskEdge>,
    /// `id -> [downstream ids]`.
    pub dependents_by_node_id: HashMap<String, Vec<String>>,
    /// `id -> remaining in-degree`. Mutated by [`TaskGraph::complete_node`];
    /// reset via [`TaskGraph::reset`] between iterations.
    pub in_degree_by_node_id: HashMap<String, usize>,
    /// `id -> owning folder-enter node id`.
    pub parent_folder_by_node_id: HashMap<String, String>,
    /// `folder item id -> [its direct child node ids]`.
    pub children_by_folder_id: HashMap<String, Vec<String>>,
    /// The single `collection-pre` node id.
    pub collection_pre_id: String,
    /// The single `collection-post` node id.
    pub collection_post_id: String,
    base_in_degree: HashMap<String, usize>,
    completed: HashSet<String>,
}

fn is_blank(script: &Option<String>) -> bool {
    script.as_ref().map(|s| s.trim().is_empty()).unwrap_or(true)
}

struct Builder {
    nodes: HashMap<String, TaskNode>,
    edges: Vec<TaskEdge>,
    item_start: HashMap<String, String>,
    item_completion: HashMap<String, String>,
    children_by_folder_id: HashMap<String, Vec<String>>,
    parent_folder_by_node_id: HashMap<String, String>,
    pending_depends: Vec<(String, String)>,
    sequential: bool,
}

impl Builder {
    fn add_node(&mut self, node: TaskNode) -> String {
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        id
    }

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        self.edges.push(TaskEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        });
    }

    /// Build one item's nodes, returning `(start_node_id, completion_node_id)`.
    fn build_item(
        &mut self,
        item: &Item,
        path: &str,
        parent_folder_path: Option<&str>,
        inherited_pre: &[String],
        inherited_post: &[String],
        inherited_auth: &Option<AuthSpec>,
    ) -> (String, String) {
        match item {
            Item::Request(request) => {
                let mut node = TaskNode::new(path, NodeKind::Request, path);
                node.parent_folder_path = parent_folder_path.map(ToString::to_string);
                node.condition = request.condition.clone();

                let mut pre_scripts = inherited_pre.to_vec();
                if let Some(script) = &request.pre_request_script {
                    if !script.trim().is_empty() {
                        pre_scripts.push(script.clone());
                    }
                }
                node.inherited_pre_scripts = pre_scripts;

                let mut post_scripts = Vec::new();
                if let Some(script) = &request.post_request_script {
                    if !script.trim().is_empty() {
                        post_scripts.push(script.clone());
                    }
                }
                post_scripts.extend(inherited_post.iter().cloned());
                node.inherited_post_scripts = post_scripts;

                node.effective_auth = match &request.auth {
                    Some(auth) if !auth.is_inherit() => Some(auth.clone()),
                    _ => inherited_auth.clone(),
                };
                node.request = Some(request.clone());

                if let Some(parent) = parent_folder_path {
                    self.parent_folder_by_node_id.insert(path.to_string(), parent.to_string());
                    self.children_by_folder_id.entry(parent.to_string()).or_default().push(path.to_string());
                }

                self.item_start.insert(request.id.clone(), path.to_string());
                self.item_completion.insert(request.id.clone(), path.to_string());
                for dep in &request.depends_on {
                    self.pending_depends.push((dep.clone(), request.id.clone()));
                }

                self.add_node(node);
                (path.to_string(), path.to_string())
            }
            Item::Folder(folder) => self.build_folder(
                folder,
                path,
                parent_folder_path,
                inherited_pre,
                inherited_post,
                inherited_auth,
            ),
        }
    }

    fn build_folder(
        &mut self,
        folder: &FolderItem,
        path: &str,
        parent_folder_path: Option<&str>,
        inherited_pre: &[String],
        inherited_post: &[String],
        inherited_auth: &Option<AuthSpec>,
    ) -> (String, String) {
        let enter_id = format!("{path}::enter");
        let exit_id = format!("{path}::exit");

        let mut enter_node = TaskNode::new(&enter_id, NodeKind::FolderEnter, path);
        enter_node.parent_folder_path = parent_folder_path.map(ToString::to_string);
        enter_node.condition = folder.condition.clone();

        let effective_auth = match &folder.auth {
            Some(auth) if !auth.is_inherit() => Some(auth.clone()),
            _ => inherited_auth.clone(),
        };
        enter_node.effective_auth = effective_auth.clone();

        let mut exit_node = TaskNode::new(&exit_id, NodeKind::FolderExit, path);
        exit_node.parent_folder_path = parent_folder_path.map(ToString::to_string);

        self.add_node(enter_node);
        self.add_node(exit_node);

        if let Some(parent) = parent_folder_path {
            self.parent_folder_by_node_id.insert(enter_id.clone(), parent.to_string());
            self.children_by_folder_id.entry(parent.to_string()).or_default().push(enter_id.clone());
        }

        let pre_node_id = if is_blank(&folder.pre_script) {
            enter_id.clone()
        } else {
            let id = format!("{path}::pre");
            let mut node = TaskNode::new(&id, NodeKind::Script, path);
            node.parent_folder_path = Some(enter_id.clone());
            node.script_type = Some(ScriptType::FolderPre);
            node.script = folder.pre_script.clone();
            self.add_node(node);
            self.add_edge(&enter_id, &id, EdgeKind::Structural);
            id
        };

        let post_node_id = if is_blank(&folder.post_script) {
            exit_id.clone()
        } else {
            let id = format!("{path}::post");
            let mut node = TaskNode::new(&id, NodeKind::Script, path);
            node.parent_folder_path = Some(enter_id.clone());
            node.script_type = Some(ScriptType::FolderPost);
            node.script = folder.post_script.clone();
            self.add_node(node);
            self.add_edge(&id, &exit_id, EdgeKind::Structural);
            id
        };

        let mut child_inherited_pre = inherited_pre.to_vec();
        if let Some(script) = &folder.pre_request_script {
            if !script.trim().is_empty() {
                child_inherited_pre.push(script.clone());
            }
        }
        let mut child_inherited_post = Vec::new();
        if let Some(script) = &folder.post_request_script {
            if !script.trim().is_empty() {
                child_inherited_post.push(script.clone());
            }
        }
        child_inherited_post.extend(inherited_post.iter().cloned());

        let before = self.nodes.len();
        let _ = before;
        let node_count_before: HashSet<String> = self.nodes.keys().cloned().collect();

        self.wire_children(
            &folder.items,
            &pre_node_id,
            &post_node_id,
            path,
            Some(&enter_id),
            &child_inherited_pre,
            &child_inherited_post,
            &effective_auth,
        );

        let mut subtree: Vec<String> =
            self.nodes.keys().filter(|id| !node_count_before.contains(*id) && **id != exit_id).cloned().collect();
        subtree.sort();
        subtree.push(exit_id.clone());
        self.nodes.get_mut(&enter_id).unwrap().subtree_node_ids = subtree;

        self.item_start.insert(folder.id.clone(), enter_id.clone());
        self.item_completion.insert(folder.id.clone(), exit_id.clone());
        for dep in &folder.depends_on {
            self.pending_depends.push((dep.clone(), folder.id.clone()));
        }

        (enter_id, exit_id)
    }

    /// Wire a sibling list between `start` and `end`, per the
    /// sequential/parallel rules.
    #[allow(clippy::too_many_arguments)]
    fn wire_children(
        &mut self,
        items: &[Item],
        start: &str,
        end: &str,
        parent_path: &str,
        parent_folder_path: Option<&str>,
        inherited_pre: &[String],
        inherited_post: &[String],
        inherited_auth: &Option<AuthSpec>,
    ) {
        if items.is_empty() {
            self.add_edge(start, end, EdgeKind::Structural);
            return;
        }

        let mut previous_completion: Option<String> = None;
        for item in items {
            let path = format!("{parent_path}.{}", item.id());
            let (item_start, item_completion) = self.build_item(
                item,
                &path,
                parent_folder_path,
                inherited_pre,
                inherited_post,
                inherited_auth,
            );

            if self.sequential {
                match &previous_completion {
                    Some(prev) => self.add_edge(prev, &item_start, EdgeKind::Structural),
                    None => self.add_edge(start, &item_start, EdgeKind::Structural),
                }
            } else {
                self.add_edge(start, &item_start, EdgeKind::Structural);
            }
            self.add_edge(&item_completion, end, EdgeKind::Structural);
            previous_completion = Some(item_completion);
        }
    }
}

impl TaskGraph {
    /// Lower `collection` into a DAG. `allow_parallel` selects sequential
    /// vs. parallel sibling wiring.
    pub fn build(collection: &Collection, allow_parallel: bool) -> Result<Self> {
        let mut builder = Builder {
            nodes: HashMap::new(),
            edges: Vec::new(),
            item_start: HashMap::new(),
            item_completion: HashMap::new(),
            children_by_folder_id: HashMap::new(),
            parent_folder_by_node_id: HashMap::new(),
            pending_depends: Vec::new(),
            sequential: !allow_parallel,
        };

        let collection_pre_id = "collection-pre".to_string();
        let collection_post_id = "collection-post".to_string();
        let mut pre_node = TaskNode::new(&collection_pre_id, NodeKind::Script, "collection-pre");
        pre_node.script_type = Some(ScriptType::CollectionPre);
        pre_node.script = collection.pre_script.clone();
        let mut post_node = TaskNode::new(&collection_post_id, NodeKind::Script, "collection-post");
        post_node.script_type = Some(ScriptType::CollectionPost);
        post_node.script = collection.post_script.clone();
        builder.add_node(pre_node);
        builder.add_node(post_node);

        let inherited_pre: Vec<String> = collection
            .pre_request_script
            .clone()
            .filter(|s| !s.trim().is_empty())
            .into_iter()
            .collect();
        let inherited_post: Vec<String> = collection
            .post_request_script
            .clone()
            .filter(|s| !s.trim().is_empty())
            .into_iter()
            .collect();
        let collection_auth = match &collection.auth {
            Some(auth) if !auth.is_inherit() => Some(auth.clone()),
            _ => None,
        };

        builder.wire_children(
            &collection.items,
            &collection_pre_id,
            &collection_post_id,
            "",
            None,
            &inherited_pre,
            &inherited_post,
            &collection_auth,
        );

        for (dep_id, target_id) in std::mem::take(&mut builder.pending_depends) {
            let Some(completion) = builder.item_completion.get(&dep_id).cloned() else {
                tracing::warn!(dep_id, "dependsOn references missing item id; skipping edge");
                continue;
            };
            let Some(start) = builder.item_start.get(&target_id).cloned() else {
                return Err(Error::graph(format!(
                    "dependsOn target item '{target_id}' does not exist in the collection"
                )));
            };
            builder.edges.push(TaskEdge {
                from: completion,
                to: start,
                kind: EdgeKind::DependsOn,
            });
        }

        let mut graph = TaskGraph {
            nodes: builder.nodes,
            edges: builder.edges,
            dependents_by_node_id: HashMap::new(),
            in_degree_by_node_id: HashMap::new(),
            parent_folder_by_node_id: builder.parent_folder_by_node_id,
            children_by_folder_id: builder.children_by_folder_id,
            collection_pre_id,
            collection_post_id,
            base_in_degree: HashMap::new(),
            completed: HashSet::new(),
        };
        graph.index();
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn index(&mut self) {
        let mut dependents: HashMap<String, Vec<String>> =
            self.nodes.keys().map(|id| (id.clone(), Vec::new())).collect();
        let mut in_degree: HashMap<String, usize> = self.nodes.keys().map(|id| (id.clone(), 0)).collect();
        for edge in &self.edges {
            dependents.entry(edge.from.clone()).or_default().push(edge.to.clone());
            *in_degree.entry(edge.to.clone()).or_insert(0) += 1;
        }
        self.dependents_by_node_id = dependents;
        self.base_in_degree = in_degree.clone();
        self.in_degree_by_node_id = in_degree;
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree = self.base_in_degree.clone();
        let mut queue: VecDeque<String> =
            in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| id.clone()).collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in self.dependents_by_node_id.get(&id).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).expect("dependent must be indexed");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent.clone());
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(Error::graph("the collection's dependsOn graph contains a cycle"));
        }
        Ok(())
    }

    /// Reset in-degrees and completion state for a new iteration. The
    /// structure (nodes/edges) is iteration-independent, built once and
    /// reused across iterations.
    pub fn reset(&mut self) {
        self.in_degree_by_node_id = self.base_in_degree.clone();
        self.completed.clear();
    }

    /// Snapshot of every node currently at in-degree 0 and not yet
    /// completed.
    pub fn ready_nodes(&self) -> Vec<String> {
        self.in_degree_by_node_id
            .iter()
            .filter(|(id, degree)| **degree == 0 && !self.completed.contains(*id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Mark `id` completed, decrementing dependents' in-degrees. Returns the
    /// dependents that newly reached in-degree 0.
    pub fn complete_node(&mut self, id: &str) -> Vec<String> {
        if !self.completed.insert(id.to_string()) {
            return Vec::new();
        }
        let mut newly_ready = Vec::new();
        for dependent in self.dependents_by_node_id.get(id).into_iter().flatten() {
            if let Some(degree) = self.in_degree_by_node_id.get_mut(dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    newly_ready.push(dependent.clone());
                }
            }
        }
        newly_ready
    }

    /// Fast-forward past a folder whose runtime condition evaluated false:
    /// marks `folder_enter_id` and every node in its stored
    /// `subtree_node_ids` as completed without executing them, returning
    /// only the dependents that become ready outside the subtree (i.e. of
    /// `folder-exit`).
    pub fn skip_subtree(&mut self, folder_enter_id: &str) -> Vec<String> {
        let subtree: HashSet<String> = self
            .nodes
            .get(folder_enter_id)
            .map(|n| n.subtree_node_ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut boundary = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(folder_enter_id.to_string());
        while let Some(id) = queue.pop_front() {
            for ready in self.complete_node(&id) {
                if subtree.contains(&ready) {
                    queue.push_back(ready);
                } else {
                    boundary.push(ready);
                }
            }
        }
        boundary
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Total edge count, used by property tests asserting in-degree sums.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionInfo, RequestData};
    use std::collections::HashMap as StdHashMap;

    fn leaf(id: &str) -> Item {
        Item::Request(RequestItem {
            id: id.to_string(),
            name: id.to_string(),
            condition: None,
            auth: None,
            depends_on: vec![],
            pre_request_script: None,
            post_request_script: None,
            data: RequestData {
                url: "https://example.com".to_string(),
                method: "GET".to_string(),
                ..Default::default()
            },
        })
    }

    fn empty_collection(items: Vec<Item>) -> Collection {
        Collection {
            info: CollectionInfo {
                id: "c1".to_string(),
                name: "C".to_string(),
            },
            protocol: "http".to_string(),
            auth: None,
            test_data: None,
            pre_script: None,
            post_script: None,
            pre_request_script: None,
            post_request_script: None,
            variables: StdHashMap::new(),
            items,
        }
    }

    #[test]
    fn empty_collection_wires_pre_directly_to_post() {
        let collection = empty_collection(vec![]);
        let graph = TaskGraph::build(&collection, true).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, "collection-pre");
        assert_eq!(graph.edges[0].to, "collection-post");
    }

    #[test]
    fn sequential_mode_chains_siblings() {
        let collection = empty_collection(vec![leaf("r1"), leaf("r2")]);
        let graph = TaskGraph::build(&collection, false).unwrap();
        // r1 -> r2 structural edge must exist.
        assert!(graph
            .edges
            .iter()
            .any(|e| e.from == ".r1" && e.to == ".r2" && matches!(e.kind, EdgeKind::Structural)));
    }

    #[test]
    fn parallel_mode_has_no_sibling_ordering_edge() {
        let collection = empty_collection(vec![leaf("r1"), leaf("r2")]);
        let graph = TaskGraph::build(&collection, true).unwrap();
        assert!(!graph.edges.iter().any(|e| e.from == ".r1" && e.to == ".r2"));
    }

    #[test]
    fn depends_on_wires_completion_to_start() {
        let mut r2 = leaf("r2");
        if let Item::Request(req) = &mut r2 {
            req.depends_on.push("r1".to_string());
        }
        let collection = empty_collection(vec![leaf("r1"), r2]);
        let graph = TaskGraph::build(&collection, true).unwrap();
        assert!(graph
            .edges
            .iter()
            .any(|e| e.from == ".r1" && e.to == ".r2" && matches!(e.kind, EdgeKind::DependsOn)));
    }

    #[test]
    fn missing_depends_on_source_is_skipped_not_an_error() {
        let mut r1 = leaf("r1");
        if let Item::Request(req) = &mut r1 {
            req.depends_on.push("ghost".to_string());
        }
        let collection = empty_collection(vec![r1]);
        let graph = TaskGraph::build(&collection, true).unwrap();
        assert!(!graph.edges.iter().any(|e| matches!(e.kind, EdgeKind::DependsOn)));
    }

    #[test]
    fn in_degree_sum_equals_edge_count() {
        let collection = empty_collection(vec![leaf("r1"), leaf("r2"), leaf("r3")]);
        let graph = TaskGraph::build(&collection, true).unwrap();
        let sum: usize = graph.base_in_degree.values().sum();
        assert_eq!(sum, graph.edge_count());
    }

    #[test]
    fn draining_all_nodes_reaches_zero_in_degree_everywhere() {
        let collection = empty_collection(vec![leaf("r1"), leaf("r2")]);
        let mut graph = TaskGraph::build(&collection, false).unwrap();
        let mut queue: VecDeque<String> = graph.ready_nodes().into();
        while let Some(id) = queue.pop_front() {
            for ready in graph.complete_node(&id) {
                queue.push_back(ready);
            }
        }
        assert!(graph.in_degree_by_node_id.values().all(|d| *d == 0));
    }
}

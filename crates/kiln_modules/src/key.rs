//! Module keys: a module's name plus a hash of everything that defines it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_cache::PathRemapper;
use kiln_common::{ContentHash, StableHasher};
use kiln_fs::FsError;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::output::{ModuleDecl, ScanOutput};

/// Identity of one module variant.
///
/// The hash covers the module's defining inputs, its canonicalized build
/// arguments, and the keys of every module it imports, so a change cascades
/// to importers and nowhere else.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleKey {
    /// Module name.
    pub name: String,
    /// Content hash of the variant.
    pub hash: ContentHash,
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.hash.short())
    }
}

impl fmt::Debug for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleKey({self})")
    }
}

/// A module declaration together with its computed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedModule {
    /// The module's key.
    pub key: ModuleKey,
    /// The declaration it was computed from.
    pub decl: ModuleDecl,
    /// Keys of the modules it imports directly.
    pub imports: Vec<ModuleKey>,
}

/// Computes keys for every module the scanned source transitively imports.
///
/// The result is in dependency order: a module always follows the modules it
/// imports. Declared modules that the source never reaches are dropped.
pub fn resolve_modules(
    task: &str,
    output: &ScanOutput,
    content_hash: &dyn Fn(&Path) -> Result<ContentHash, FsError>,
    remapper: &PathRemapper,
) -> Result<Vec<ResolvedModule>, ScanError> {
    if let Some(module) = output.unresolved.first() {
        return Err(ScanError::UnresolvedModule {
            module: module.clone(),
            task: task.to_string(),
        });
    }

    let decls: HashMap<&str, &ModuleDecl> =
        output.modules.iter().map(|m| (m.name.as_str(), m)).collect();
    let lookup = |name: &str| {
        decls.get(name).copied().ok_or_else(|| ScanError::UnresolvedModule {
            module: name.to_string(),
            task: task.to_string(),
        })
    };

    let mut reachable = BTreeSet::new();
    let mut queue: VecDeque<&str> = output.imports.iter().map(String::as_str).collect();
    while let Some(name) = queue.pop_front() {
        let decl = lookup(name)?;
        if reachable.insert(decl.name.as_str()) {
            queue.extend(decl.imports.iter().map(String::as_str));
        }
    }

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let nodes: BTreeMap<&str, NodeIndex> = reachable
        .iter()
        .map(|name| (*name, graph.add_node(*name)))
        .collect();
    for (&name, node) in &nodes {
        for import in &lookup(name)?.imports {
            graph.add_edge(nodes[import.as_str()], *node, ());
        }
    }
    let order = toposort(&graph, None).map_err(|cycle| ScanError::ImportCycle {
        module: graph[cycle.node_id()].to_string(),
        task: task.to_string(),
    })?;

    let mut keys: HashMap<&str, ModuleKey> = HashMap::new();
    let mut resolved = Vec::with_capacity(order.len());
    for node in order {
        let decl = lookup(graph[node])?;
        let mut imports: Vec<ModuleKey> = decl
            .imports
            .iter()
            .map(|name| keys[name.as_str()].clone())
            .collect();
        imports.sort();
        imports.dedup();
        let key = module_key(decl, &imports, content_hash, remapper)
            .map_err(|source| ScanError::Input {
                task: task.to_string(),
                source,
            })?;
        keys.insert(decl.name.as_str(), key.clone());
        resolved.push(ResolvedModule {
            key,
            decl: decl.clone(),
            imports,
        });
    }
    Ok(resolved)
}

fn module_key(
    decl: &ModuleDecl,
    imports: &[ModuleKey],
    content_hash: &dyn Fn(&Path) -> Result<ContentHash, FsError>,
    remapper: &PathRemapper,
) -> Result<ModuleKey, FsError> {
    let mut inputs: Vec<(PathBuf, ContentHash)> = Vec::with_capacity(decl.defining_inputs.len());
    for path in &decl.defining_inputs {
        inputs.push((remapper.remap_path(path), content_hash(path)?));
    }
    inputs.sort();

    let mut hasher = StableHasher::new("kiln.module-key.v1");
    hasher.write_str(&decl.name);
    hasher.write_u64(inputs.len() as u64);
    for (path, hash) in &inputs {
        hasher.write_path(path).write_hash(hash);
    }
    let arguments: Vec<String> = decl.arguments.iter().map(|a| remapper.remap_arg(a)).collect();
    hasher.write_strs(&arguments);
    hasher.write_u64(imports.len() as u64);
    for import in imports {
        hasher.write_str(&import.name).write_hash(&import.hash);
    }
    Ok(ModuleKey {
        name: decl.name.clone(),
        hash: hasher.finish(),
    })
}

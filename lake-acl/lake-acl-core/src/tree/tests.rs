use super::*;
use crate::acl::{AclEntry, EntryScope};
use crate::config::{ContainerConfig, EntryConfig};

fn entry_config(p_type: &str, oid: &str, acl: &str) -> EntryConfig {
    EntryConfig {
        principal_type: Some(p_type.to_string()),
        oid: Some(oid.to_string()),
        acl: Some(acl.to_string()),
        ..Default::default()
    }
}

fn folder(name: &str, acls: Vec<EntryConfig>, folders: Vec<ContainerConfig>) -> ContainerConfig {
    ContainerConfig {
        name: name.to_string(),
        acls,
        folders,
    }
}

/// Root with one entry, a folder and a subfolder below it.
fn container() -> ContainerConfig {
    folder(
        "test_container",
        vec![entry_config("user", "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx", "r-x")],
        vec![folder(
            "test_folder",
            vec![entry_config("user", "yyyyyyyy-yyyy-yyyy-yyyy-yyyyyyyyyyyy", "--x")],
            vec![folder(
                "test_subfolder_one",
                vec![entry_config("user", "yyyyyyyy-yyyy-yyyy-yyyy-yyyyyyyyyyyy", "--x")],
                vec![],
            )],
        )],
    )
}

/// root -> [a -> [a1], b]
fn branching() -> Tree {
    let mut tree = Tree::new("root");
    let root = tree.root();
    let a = tree.add_child(root, "a");
    tree.add_child(root, "b");
    tree.add_child(a, "a1");
    tree
}

fn names(tree: &Tree, ids: impl Iterator<Item = NodeId>) -> Vec<String> {
    ids.map(|id| tree.name(id).to_string()).collect()
}

fn leaf(tree: &Tree) -> NodeId {
    let mut id = tree.root();
    while let Some(child) = tree.node(id).children().first() {
        id = *child;
    }
    id
}

#[test]
fn container_config_to_tree() {
    let tree = Tree::from_config(&container()).unwrap();
    let root = tree.root();
    assert!(tree.is_root(root));
    assert_eq!(tree.kind(root), NodeKind::Root);
    assert_eq!(tree.name(root), "test_container");
    assert_eq!(tree.node(root).children().len(), 1);
    assert_eq!(tree.node(root).acls().len(), 1);
    let child = tree.node(root).children()[0];
    assert_eq!(tree.kind(child), NodeKind::Directory);
    assert_eq!(tree.node(child).acls().len(), 1);
}

#[test]
fn chain_traversals_yield_three_nodes() {
    let tree = Tree::from_config(&container()).unwrap();
    assert_eq!(tree.breadth_first().count(), 3);
    assert_eq!(
        names(&tree, tree.depth_first()),
        vec!["test_container", "test_folder", "test_subfolder_one"]
    );
}

#[test]
fn breadth_first_is_level_order() {
    let tree = branching();
    assert_eq!(names(&tree, tree.breadth_first()), vec!["root", "a", "b", "a1"]);
}

#[test]
fn depth_first_visits_last_declared_child_first() {
    let tree = branching();
    assert_eq!(names(&tree, tree.depth_first()), vec!["root", "b", "a", "a1"]);
}

#[test]
fn traversals_restart_from_root() {
    let tree = branching();
    let first: Vec<_> = tree.breadth_first().collect();
    let second: Vec<_> = tree.breadth_first().collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), tree.len());
}

#[test]
fn walk_allows_mutation_between_steps() {
    let mut tree = branching();
    let mut walk = tree.walk(Order::BreadthFirst);
    let mut visited = 0;
    while let Some(id) = walk.next(&tree) {
        tree.add_acl(id, AclEntry::parse_wire("other::---").unwrap());
        visited += 1;
    }
    assert_eq!(visited, 4);
    assert!(tree.breadth_first().all(|id| tree.node(id).acls().len() == 1));
}

#[test]
fn paths() {
    let tree = Tree::from_config(&container()).unwrap();
    let root = tree.root();
    let leaf = leaf(&tree);
    assert_eq!(tree.path(root), "test_container");
    assert_eq!(tree.path_in_filesystem(root), "");
    assert_eq!(tree.path(leaf), "test_folder/test_subfolder_one");
    assert_eq!(tree.path_in_filesystem(leaf), "test_folder/test_subfolder_one");
    assert_eq!(
        tree.display_path(leaf),
        "test_container/test_folder/test_subfolder_one"
    );
}

#[test]
fn short_paths() {
    let mut tree = Tree::new("c");
    let dir = tree.add_child(tree.root(), "dir");
    let sub = tree.add_child(dir, "sub");
    assert_eq!(tree.path(tree.root()), "c");
    assert_eq!(tree.path(sub), "dir/sub");
    assert_eq!(tree.path_in_filesystem(sub), "dir/sub");
    assert_eq!(tree.path(dir), "dir");
}

#[test]
fn get_root_follows_parents() {
    let tree = Tree::from_config(&container()).unwrap();
    assert_eq!(tree.get_root(leaf(&tree)), tree.root());
    assert_eq!(tree.get_root(tree.root()), tree.root());
}

#[test]
fn add_child_registers_with_parent() {
    let mut tree = branching();
    let b = tree.find_by_relative_path(tree.root(), "b").unwrap();
    let child = tree.add_child(b, "b1");
    assert_eq!(tree.node(child).parent(), Some(b));
    assert_eq!(tree.node(b).children(), &[child]);
    assert!(tree.node(child).children().is_empty());
}

#[test]
fn add_acl_merges_by_identity() {
    let mut tree = Tree::from_config(&container()).unwrap();
    let leaf = leaf(&tree);
    tree.add_acl(leaf, AclEntry::parse_wire("user:zzzzzzz:---").unwrap());
    assert_eq!(tree.node(leaf).acls().len(), 2);
    let replaced = tree.add_acl(leaf, AclEntry::parse_wire("user:zzzzzzz:rwx").unwrap());
    assert_eq!(replaced.unwrap().permissions().as_str(), "---");
    assert_eq!(tree.node(leaf).acls().len(), 2);
}

#[test]
fn find_by_relative_path() {
    let mut tree = Tree::new("c");
    let dir = tree.add_child(tree.root(), "dir");
    let sub = tree.add_child(dir, "sub");
    assert_eq!(tree.find_by_relative_path(tree.root(), "dir/sub"), Some(sub));
    assert_eq!(tree.path_in_filesystem(sub), "dir/sub");
    assert_eq!(tree.find_by_relative_path(tree.root(), "dir/nope"), None);
    assert_eq!(tree.find_by_relative_path(tree.root(), ""), Some(tree.root()));
    assert_eq!(tree.find_by_relative_path(dir, "sub"), Some(sub));
    assert_eq!(tree.find_by_relative_path(tree.root(), "dir/"), None);
}

#[test]
fn to_document_omits_empty_folders() {
    let tree = Tree::from_config(&container()).unwrap();
    let doc = tree.to_document(tree.root());
    assert_eq!(doc.name, "test_container");
    assert_eq!(doc.acls.len(), 1);
    assert_eq!(doc.folders[0].folders[0].name, "test_subfolder_one");
    assert!(doc.folders[0].folders[0].folders.is_empty());

    let yaml = serde_yaml::to_string(&tree.to_document(leaf(&tree))).unwrap();
    assert!(!yaml.contains("folders"));
    assert!(yaml.contains("acls"));
}

#[test]
fn default_acl_declares_default_scope() {
    let mut config = container();
    config.acls.push(EntryConfig {
        principal_type: Some("group".to_string()),
        oid: Some("g".to_string()),
        default_acl: Some("rwx".to_string()),
        ..Default::default()
    });
    let tree = Tree::from_config(&config).unwrap();
    let defaults = tree.node(tree.root()).acls().defaults();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults.iter().next().unwrap().scope(), EntryScope::Default);
}

#[test]
fn folder_without_name_is_rejected() {
    let mut config = container();
    config.folders.push(folder("", vec![], vec![]));
    let err = Tree::from_config(&config).unwrap_err();
    assert_eq!(err.location, "container.folders[1]");
    assert!(err.rule.contains("name"));
}

#[test]
fn folder_name_with_slash_is_rejected() {
    let mut config = container();
    config.folders[0].folders.push(folder("a/b", vec![], vec![]));
    let err = Tree::from_config(&config).unwrap_err();
    assert_eq!(err.location, "container.folders[0].folders[1]");
}

#[test]
fn duplicate_sibling_is_rejected() {
    let mut config = container();
    config.folders.push(folder("test_folder", vec![], vec![]));
    let err = Tree::from_config(&config).unwrap_err();
    assert!(err.rule.contains("unique"));
}

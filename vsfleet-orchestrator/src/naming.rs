use uuid::Uuid;

/// Fresh, collision-resistant instance name: `{prefix}-{uuid}`.
pub fn instance_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Folder path without the trailing separator (`/DC0/vm/` -> `/DC0/vm`).
pub fn folder_path(folder: &str) -> &str {
    let trimmed = folder.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Inventory path of an instance inside the group folder.
pub fn instance_path(folder: &str, name: &str) -> String {
    match folder_path(folder) {
        "/" => format!("/{}", name),
        dir => format!("{}/{}", dir, name),
    }
}

/// Whether a VM name belongs to the group.
pub fn is_managed(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix)
}

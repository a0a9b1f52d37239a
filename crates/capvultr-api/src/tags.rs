//! Ownership tags attached to cloud resources

/// Prefix of every tag written by this controller
pub const TAG_PREFIX: &str = "sigs-k8s-io:capvultr";

/// Role tag for control-plane (API server) instances
pub const API_SERVER_ROLE: &str = "apiserver";

/// Role tag for worker instances
pub const NODE_ROLE: &str = "node";

/// Inputs for [`build_tags`]
#[derive(Debug, Clone, Default)]
pub struct TagParams<'a> {
    pub cluster_name: &'a str,
    pub cluster_uid: &'a str,
    pub name: &'a str,
    pub role: &'a str,
    pub additional: &'a [String],
}

pub fn cluster_name_tag(cluster_name: &str) -> String {
    format!("{}:{}", TAG_PREFIX, cluster_name)
}

pub fn cluster_role_tag(cluster_name: &str, role: &str) -> String {
    format!("{}:{}:{}", TAG_PREFIX, cluster_name, role)
}

pub fn cluster_uid_role_tag(cluster_name: &str, cluster_uid: &str, role: &str) -> String {
    format!("{}:{}:{}:{}", TAG_PREFIX, cluster_name, cluster_uid, role)
}

pub fn name_tag(name: &str) -> String {
    format!("name:{}", name)
}

/// Builds the tag list for a resource owned by a cluster
pub fn build_tags(params: &TagParams<'_>) -> Vec<String> {
    let mut tags = vec![
        cluster_name_tag(params.cluster_name),
        cluster_role_tag(params.cluster_name, params.role),
        cluster_uid_role_tag(params.cluster_name, params.cluster_uid, params.role),
        name_tag(params.name),
    ];
    tags.extend(params.additional.iter().cloned());
    tags
}

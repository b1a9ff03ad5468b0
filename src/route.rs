//! Route descriptors: which rate-limit bucket a concrete path belongs to.
//!
//! Derivation is a pure function of `(method, path)`:
//! - the segment following a resource family name (`/project/{id}`, `/team/{id}/members/{id}`)
//!   and any all-digit segment are replaced by `:id` to form the bucket route;
//! - when the path starts with a top-level resource family, its id is the major parameter,
//!   which splits the bucket per resource. Otherwise the major parameter is `global`.

use crate::request::Method;

/// Top-level families whose id partitions a bucket.
const MAJOR_RESOURCES: &[&str] = &["project", "version", "user", "team"];

/// Segments whose following segment is an opaque id.
const ID_PARENTS: &[&str] = &[
    "project",
    "version",
    "user",
    "team",
    "version_file",
    "members",
    "notification",
    "report",
    "thread",
];

/// Placeholder substituted for stripped ids.
pub const ID_PLACEHOLDER: &str = ":id";

/// Major parameter used when a route has no per-resource partition.
pub const GLOBAL_MAJOR: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteDescriptor {
    pub method: Method,
    /// The concrete path the caller asked for.
    pub original: String,
    /// The path with ids stripped, e.g. `/project/:id/version`.
    pub bucket_route: String,
    pub major_parameter: String,
}

impl RouteDescriptor {
    pub fn derive(method: Method, path: &str) -> Self {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        let major_parameter = match segments.as_slice() {
            [family, id, ..] if MAJOR_RESOURCES.contains(family) && !id.is_empty() => {
                (*id).to_string()
            }
            _ => GLOBAL_MAJOR.to_string(),
        };

        let mut generalized = Vec::with_capacity(segments.len());
        let mut previous: Option<&str> = None;
        for segment in segments.iter().copied() {
            let is_id = !segment.is_empty()
                && (previous.is_some_and(|p| ID_PARENTS.contains(&p))
                    || segment.bytes().all(|b| b.is_ascii_digit()));
            generalized.push(if is_id { ID_PLACEHOLDER } else { segment });
            // an id never marks the segment after it as an id
            previous = if is_id { None } else { Some(segment) };
        }

        Self {
            method,
            original: path.to_string(),
            bucket_route: format!("/{}", generalized.join("/")),
            major_parameter,
        }
    }

    /// Key of the bucket handler serving this route.
    pub fn bucket_key(&self) -> String {
        format!("{}:{}:{}", self.method, self.bucket_route, self.major_parameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_routes_partition_by_id() {
        let route = RouteDescriptor::derive(Method::Get, "/project/AANobbMI/version");
        assert_eq!(route.bucket_route, "/project/:id/version");
        assert_eq!(route.major_parameter, "AANobbMI");
        assert_eq!(route.bucket_key(), "GET:/project/:id/version:AANobbMI");
        assert_eq!(route.original, "/project/AANobbMI/version");
    }

    #[test]
    fn unpartitioned_routes_are_global() {
        let route = RouteDescriptor::derive(Method::Get, "/search");
        assert_eq!(route.bucket_route, "/search");
        assert_eq!(route.major_parameter, GLOBAL_MAJOR);

        let route = RouteDescriptor::derive(Method::Get, "/tag/category");
        assert_eq!(route.bucket_route, "/tag/category");
        assert_eq!(route.major_parameter, GLOBAL_MAJOR);
    }

    #[test]
    fn nested_and_numeric_ids_are_stripped() {
        let route = RouteDescriptor::derive(Method::Patch, "/team/TEAM1/members/USER9");
        assert_eq!(route.bucket_route, "/team/:id/members/:id");
        assert_eq!(route.major_parameter, "TEAM1");

        let route = RouteDescriptor::derive(Method::Get, "/version_file/abc123def/update");
        assert_eq!(route.bucket_route, "/version_file/:id/update");
        assert_eq!(route.major_parameter, GLOBAL_MAJOR);

        let route = RouteDescriptor::derive(Method::Get, "/statistics/2024");
        assert_eq!(route.bucket_route, "/statistics/:id");
    }

    #[test]
    fn bare_family_has_no_major_parameter() {
        let route = RouteDescriptor::derive(Method::Get, "/user");
        assert_eq!(route.bucket_route, "/user");
        assert_eq!(route.major_parameter, GLOBAL_MAJOR);
    }

    #[test]
    fn method_separates_buckets() {
        let get = RouteDescriptor::derive(Method::Get, "/project/abc");
        let patch = RouteDescriptor::derive(Method::Patch, "/project/abc");
        assert_eq!(get.bucket_route, patch.bucket_route);
        assert_ne!(get.bucket_key(), patch.bucket_key());
    }

    #[test]
    fn derivation_is_pure() {
        let a = RouteDescriptor::derive(Method::Delete, "/version/xyz");
        let b = RouteDescriptor::derive(Method::Delete, "/version/xyz");
        assert_eq!(a, b);
    }
}

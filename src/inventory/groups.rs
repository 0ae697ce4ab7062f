// Group filtering and host selection

use super::Host;

/// True when `host` belongs to `group`: the implicit `all` group, the group
/// named by the host's own address, or one of its explicit tags.
pub fn host_matches_group(host: &Host, group: &str) -> bool {
    group == "all" || group == host.address() || host.groups.iter().any(|g| g == group)
}

/// Filter options for host selection
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    /// Limit to hosts matching any of these addresses or groups
    pub limit: Option<Vec<String>>,
    /// Exclude hosts matching any of these addresses or groups
    pub exclude: Option<Vec<String>>,
}

impl HostFilter {
    pub fn new() -> Self {
        HostFilter::default()
    }

    pub fn with_limit(mut self, selectors: Vec<String>) -> Self {
        self.limit = Some(selectors);
        self
    }

    pub fn with_exclude(mut self, selectors: Vec<String>) -> Self {
        self.exclude = Some(selectors);
        self
    }

    /// Parse a comma-separated selector list as given on the command line
    pub fn parse_list(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Apply filter to hosts, keeping inventory order
    pub fn apply<'a>(&self, hosts: impl IntoIterator<Item = &'a Host>) -> Vec<&'a Host> {
        let mut result: Vec<&Host> = hosts.into_iter().collect();

        // Apply limit
        if let Some(ref limit) = self.limit {
            result.retain(|h| limit.iter().any(|sel| host_matches_group(h, sel)));
        }

        // Apply exclude
        if let Some(ref exclude) = self.exclude {
            result.retain(|h| !exclude.iter().any(|sel| host_matches_group(h, sel)));
        }

        result
    }
}

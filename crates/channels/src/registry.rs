use {super::plugin::ChannelPlugin, std::collections::HashMap};

/// Registry of all loaded channel plugins, owned by the host supervisor.
pub struct ChannelRegistry {
    plugins: HashMap<String, Box<dyn ChannelPlugin>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<&dyn ChannelPlugin> {
        self.plugins.get(id).map(|p| p.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plugins.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

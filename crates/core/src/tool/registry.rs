use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use super::call::{ToolCall, ToolContext, ToolResponse};
use super::definition::{Parameters, ToolDefinition};
use super::duration_secs;
use super::error::ToolError;
use super::hooks::{run_execution_hooks, run_register_hooks, ExecutionEvent, Hook, HookKind};
use super::{safe_execute, Tool};

const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    #[serde(with = "duration_secs")]
    pub total_execution_time: Duration,
    #[serde(with = "duration_secs")]
    pub average_execution_time: Duration,
    #[serde(default)]
    pub last_called: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_messages: VecDeque<String>,
}

impl ToolExecutionStats {
    pub fn record(&mut self, response: &ToolResponse) {
        self.total_calls += 1;
        if response.success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
            self.error_messages
                .push_back(response.error_message().to_string());
            while self.error_messages.len() > MAX_ERROR_MESSAGES {
                self.error_messages.pop_front();
            }
        }
        self.total_execution_time += response.execution_time;
        self.average_execution_time = self.total_execution_time.div_f64(self.total_calls as f64);
        self.last_called = Some(response.timestamp);
    }

    /// Percentage of successful calls, `0.0` before the first call.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64 * 100.0
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RegistryStats {
    pub total_tools: usize,
    pub categories: BTreeMap<String, usize>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub execution_stats: BTreeMap<String, ToolExecutionStats>,
}

impl RegistryStats {
    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(per_tool) = value
            .get_mut("execution_stats")
            .and_then(Value::as_object_mut)
        {
            for (name, entry) in per_tool.iter_mut() {
                let rate = self
                    .execution_stats
                    .get(name)
                    .map(ToolExecutionStats::success_rate)
                    .unwrap_or_default();
                if let Some(object) = entry.as_object_mut() {
                    object.insert("success_rate".to_string(), Value::from(rate));
                }
            }
        }
        value
    }
}

#[derive(Default)]
struct RegistryState {
    tools: HashMap<String, Arc<dyn Tool>>,
    aliases: HashMap<String, String>,
    categories: BTreeMap<String, BTreeSet<String>>,
    dependencies: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn resolve(&self, name: &str) -> Option<String> {
        if self.tools.contains_key(name) {
            Some(name.to_string())
        } else {
            self.aliases
                .get(name)
                .filter(|target| self.tools.contains_key(*target))
                .cloned()
        }
    }

    fn detach_category(&mut self, name: &str, category: &str) {
        if let Some(members) = self.categories.get_mut(category) {
            members.remove(name);
            if members.is_empty() {
                self.categories.remove(category);
            }
        }
    }
}

/// Name → tool dispatcher with aliases, categories, dependency checks,
/// lifecycle hooks and per-tool execution statistics.
///
/// Locks are never held across an `.await`; tool bodies and hooks run with
/// the registry unlocked.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    stats: Mutex<HashMap<String, ToolExecutionStats>>,
    hooks: RwLock<HashMap<HookKind, Vec<Hook>>>,
    started: Instant,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            stats: Mutex::new(HashMap::new()),
            hooks: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    pub fn register<T>(&self, tool: T) -> Result<(), ToolError>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool), &[])
    }

    pub fn register_with_aliases<T>(&self, tool: T, aliases: &[&str]) -> Result<(), ToolError>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool), aliases)
    }

    /// Registers an already shared tool. An existing tool or alias with the
    /// same name is replaced and its statistics start over.
    pub fn register_shared(&self, tool: Arc<dyn Tool>, aliases: &[&str]) -> Result<(), ToolError> {
        let definition = tool.definition().clone();
        let name = definition.name.trim().to_string();
        if name.is_empty() {
            return Err(ToolError::InvalidDefinition(
                "tool name must not be empty".to_string(),
            ));
        }

        let hooks = self.hooks_for(HookKind::BeforeRegister);
        run_register_hooks(&hooks, HookKind::BeforeRegister, &definition);

        {
            let mut state = self.write_state();
            if let Some(previous) = state.tools.insert(name.clone(), tool) {
                warn!("工具 {} 已存在，将被覆盖", name);
                let old_category = previous.definition().category.clone();
                state.detach_category(&name, &old_category);
            }
            state
                .categories
                .entry(definition.category.clone())
                .or_default()
                .insert(name.clone());

            for alias in aliases {
                let alias = alias.trim();
                if alias.is_empty() || alias == name {
                    continue;
                }
                if let Some(previous) = state.aliases.insert(alias.to_string(), name.clone()) {
                    if previous != name {
                        warn!("别名 {} 原指向 {}，现改为指向 {}", alias, previous, name);
                    }
                }
            }
        }

        self.lock_stats()
            .insert(name.clone(), ToolExecutionStats::default());

        let hooks = self.hooks_for(HookKind::AfterRegister);
        run_register_hooks(&hooks, HookKind::AfterRegister, &definition);

        info!("注册工具: {} (类别: {})", name, definition.category);
        Ok(())
    }

    /// Removes a tool together with its aliases, category entry, dependency list and stats.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.write_state();
            let Some(resolved) = state.resolve(name) else {
                return false;
            };
            let Some(tool) = state.tools.remove(&resolved) else {
                return false;
            };
            let category = tool.definition().category.clone();
            state.detach_category(&resolved, &category);
            state.aliases.retain(|_, target| target != &resolved);
            state.dependencies.remove(&resolved);
            resolved
        };

        self.lock_stats().remove(&removed);
        info!("注销工具: {}", removed);
        true
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let state = self.read_state();
        state
            .resolve(name)
            .and_then(|resolved| state.tools.get(&resolved).cloned())
    }

    /// Maps a tool name or alias to the registered tool name.
    pub fn resolve_name(&self, name: &str) -> Option<String> {
        self.read_state().resolve(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve_name(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.read_state().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn aliases_of(&self, name: &str) -> Vec<String> {
        let state = self.read_state();
        let mut aliases: Vec<String> = state
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == name)
            .map(|(alias, _)| alias.clone())
            .collect();
        aliases.sort();
        aliases
    }

    /// Sorted tool names, optionally limited to one category. Hidden tools
    /// (leading `_`) are skipped unless `include_hidden` is set.
    pub fn list_tools(&self, category: Option<&str>, include_hidden: bool) -> Vec<String> {
        let state = self.read_state();
        let mut names: Vec<String> = match category {
            Some(category) => state
                .categories
                .get(category)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default(),
            None => state.tools.keys().cloned().collect(),
        };
        if !include_hidden {
            names.retain(|name| !name.starts_with('_'));
        }
        names.sort();
        names
    }

    pub fn list_categories(&self) -> Vec<String> {
        self.read_state().categories.keys().cloned().collect()
    }

    pub fn search_tools(&self, query: &str) -> Vec<String> {
        let state = self.read_state();
        let mut names: Vec<String> = state
            .tools
            .iter()
            .filter(|(_, tool)| tool.definition().matches(query))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn set_dependencies<I, S>(&self, name: &str, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deps: Vec<String> = dependencies.into_iter().map(Into::into).collect();
        let mut state = self.write_state();
        let key = state.resolve(name).unwrap_or_else(|| name.to_string());
        if deps.is_empty() {
            state.dependencies.remove(&key);
        } else {
            state.dependencies.insert(key, deps);
        }
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let state = self.read_state();
        let key = state.resolve(name).unwrap_or_else(|| name.to_string());
        state.dependencies.get(&key).cloned().unwrap_or_default()
    }

    pub fn check_dependencies(&self, name: &str) -> Result<(), ToolError> {
        let state = self.read_state();
        let key = state.resolve(name).unwrap_or_else(|| name.to_string());
        let missing: Vec<String> = state
            .dependencies
            .get(&key)
            .map(|deps| {
                deps.iter()
                    .filter(|dep| state.resolve(dep).is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ToolError::MissingDependency { tool: key, missing })
        }
    }

    pub fn add_hook(&self, kind: HookKind, hook: Hook) -> Result<(), ToolError> {
        if !hook.accepts(kind) {
            return Err(ToolError::HookMismatch { kind });
        }
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(hook);
        debug!("已添加 {} 钩子", kind);
        Ok(())
    }

    /// Executes one call. Unknown tools and unmet dependencies yield a failure
    /// response and leave statistics untouched; every other path records the
    /// outcome exactly once, after the tool body finished.
    pub async fn execute_tool(&self, call: &ToolCall, context: &ToolContext) -> ToolResponse {
        let Some((name, tool)) = self.lookup(&call.name) else {
            warn!("工具不存在: {}", call.name);
            let err = ToolError::NotFound(call.name.clone());
            return ToolResponse::failure(&call.id, &call.name, err.to_string(), Duration::ZERO);
        };

        if let Err(err) = self.check_dependencies(&name) {
            warn!("工具 {} 依赖检查失败: {}", name, err);
            return ToolResponse::failure(&call.id, &name, err.to_string(), Duration::ZERO);
        }

        let event = ExecutionEvent::new(call.clone(), context.clone());
        let hooks = self.hooks_for(HookKind::BeforeExecute);
        run_execution_hooks(&hooks, HookKind::BeforeExecute, &event).await;

        let response = safe_execute(tool.as_ref(), &call.id, &call.parameters, context).await;
        self.record(&name, &response);
        debug!(
            "工具 {} 执行完成: success={}, 耗时 {:.3}s",
            name,
            response.success,
            response.execution_time.as_secs_f64()
        );

        let event = event.with_response(response.clone());
        let hooks = self.hooks_for(HookKind::AfterExecute);
        run_execution_hooks(&hooks, HookKind::AfterExecute, &event).await;

        if !response.success {
            let hooks = self.hooks_for(HookKind::OnError);
            run_execution_hooks(&hooks, HookKind::OnError, &event).await;
        }

        response
    }

    pub async fn execute(
        &self,
        name: &str,
        parameters: Parameters,
        context: &ToolContext,
    ) -> ToolResponse {
        let call = ToolCall::new(name, parameters);
        self.execute_tool(&call, context).await
    }

    /// Runs all calls concurrently; responses come back in input order.
    pub async fn batch_execute(&self, calls: &[ToolCall], context: &ToolContext) -> Vec<ToolResponse> {
        info!("批量执行 {} 个工具调用", calls.len());
        join_all(calls.iter().map(|call| self.execute_tool(call, context))).await
    }

    pub fn tool_stats(&self, name: &str) -> Option<ToolExecutionStats> {
        let resolved = self.resolve_name(name)?;
        self.lock_stats().get(&resolved).cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        let (total_tools, categories) = {
            let state = self.read_state();
            let categories = state
                .categories
                .iter()
                .map(|(category, members)| (category.clone(), members.len()))
                .collect();
            (state.tools.len(), categories)
        };
        let execution_stats: BTreeMap<String, ToolExecutionStats> = self
            .lock_stats()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();

        let total_calls = execution_stats.values().map(|s| s.total_calls).sum();
        let successful_calls = execution_stats.values().map(|s| s.successful_calls).sum();
        let failed_calls = execution_stats.values().map(|s| s.failed_calls).sum();
        let success_rate = if total_calls == 0 {
            0.0
        } else {
            successful_calls as f64 / total_calls as f64 * 100.0
        };

        RegistryStats {
            total_tools,
            categories,
            total_calls,
            successful_calls,
            failed_calls,
            success_rate,
            uptime: self.started.elapsed(),
            execution_stats,
        }
    }

    pub fn export_definitions(&self) -> Vec<ToolDefinition> {
        let state = self.read_state();
        let mut definitions: Vec<ToolDefinition> = state
            .tools
            .values()
            .map(|tool| tool.definition().clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Returns the problems found per tool; tools without problems are omitted.
    pub fn validate_all_tools(&self) -> BTreeMap<String, Vec<String>> {
        let mut report = BTreeMap::new();
        let names: Vec<(String, ToolDefinition)> = {
            let state = self.read_state();
            state
                .tools
                .iter()
                .map(|(name, tool)| (name.clone(), tool.definition().clone()))
                .collect()
        };

        for (name, definition) in names {
            let mut problems = Vec::new();
            if definition.description.trim().is_empty() {
                problems.push("缺少工具描述".to_string());
            }
            let mut seen = BTreeSet::new();
            for parameter in &definition.parameters {
                if parameter.name.trim().is_empty() {
                    problems.push("存在未命名的参数".to_string());
                } else if !seen.insert(parameter.name.as_str()) {
                    problems.push(format!("参数 {} 重复定义", parameter.name));
                }
                if let Some(default) = &parameter.default {
                    if !parameter.kind.accepts(default) {
                        problems.push(format!(
                            "参数 {} 的默认值与类型 {} 不匹配",
                            parameter.name, parameter.kind
                        ));
                    }
                }
            }
            if let Err(err) = self.check_dependencies(&name) {
                problems.push(err.to_string());
            }
            if !problems.is_empty() {
                report.insert(name, problems);
            }
        }

        report
    }

    fn lookup(&self, name: &str) -> Option<(String, Arc<dyn Tool>)> {
        let state = self.read_state();
        let resolved = state.resolve(name)?;
        let tool = state.tools.get(&resolved).cloned()?;
        Some((resolved, tool))
    }

    /// Tools unregistered while a call was in flight are not recorded.
    fn record(&self, name: &str, response: &ToolResponse) {
        if let Some(stats) = self.lock_stats().get_mut(name) {
            stats.record(response);
        }
    }

    fn hooks_for(&self, kind: HookKind) -> Vec<Hook> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, HashMap<String, ToolExecutionStats>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

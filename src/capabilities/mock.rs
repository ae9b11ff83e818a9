//! 确定性 mock 协作方（用于测试与本地演示，无需真实设备）
//!
//! ScriptedPerception / ScriptedPlanner / ScriptedHandler 按脚本返回结果；
//! SimulatedHandler 带固定延迟与周期性失败，用于演示调度与重试。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::capabilities::{
    ActionExecutor, ActionHandler, ActionRegistry, Collaborators, Perception, Planner,
};
use crate::core::pool::ExecutionTarget;
use crate::core::state::{Action, UiSnapshot};
use crate::core::TaskError;

/// "log in" 的三步计划：输入用户名、输入密码、点击登录
pub fn login_plan() -> Vec<Action> {
    vec![
        Action::new("type_text", json!({"element": "username_field", "text": "demo"})),
        Action::new("type_text", json!({"element": "password_field", "text": "secret"})),
        Action::new("tap", json!({"element": "login_button"})),
    ]
}

fn element_key(action: &Action) -> String {
    action
        .params
        .get("element")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// 按脚本返回界面快照；可以让前几次调用失败
pub struct ScriptedPerception {
    data: serde_json::Value,
    failures: Mutex<VecDeque<TaskError>>,
    calls: AtomicU32,
}

impl ScriptedPerception {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// 登录页
    pub fn login_screen() -> Self {
        Self::new(json!({
            "screen": "login",
            "elements": ["username_field", "password_field", "login_button"],
        }))
    }

    pub fn fail_first(self, errors: Vec<TaskError>) -> Self {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = errors.into();
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Perception for ScriptedPerception {
    async fn capture(&self, target: &ExecutionTarget) -> Result<UiSnapshot, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            return Err(err);
        }
        let mut data = self.data.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("target".to_string(), json!(target.id));
        }
        Ok(UiSnapshot::new(data))
    }
}

/// 按脚本返回计划与修正计划
pub struct ScriptedPlanner {
    default_plan: Vec<Action>,
    plans: Mutex<VecDeque<Result<Vec<Action>, TaskError>>>,
    corrections: Mutex<VecDeque<Option<Vec<Action>>>>,
    /// 修正脚本耗尽后的默认修正计划
    fallback_correction: Option<Vec<Action>>,
    plan_calls: AtomicU32,
    replan_calls: AtomicU32,
}

impl ScriptedPlanner {
    pub fn new(default_plan: Vec<Action>) -> Self {
        Self {
            default_plan,
            plans: Mutex::new(VecDeque::new()),
            corrections: Mutex::new(VecDeque::new()),
            fallback_correction: None,
            plan_calls: AtomicU32::new(0),
            replan_calls: AtomicU32::new(0),
        }
    }

    /// 依次返回这些结果，之后回到 default_plan
    pub fn with_plans(self, plans: Vec<Result<Vec<Action>, TaskError>>) -> Self {
        *self.plans.lock().unwrap_or_else(|e| e.into_inner()) = plans.into();
        self
    }

    /// replan 依次返回这些结果，之后返回 fallback（默认 None）
    pub fn with_corrections(self, corrections: Vec<Option<Vec<Action>>>) -> Self {
        *self.corrections.lock().unwrap_or_else(|e| e.into_inner()) = corrections.into();
        self
    }

    pub fn always_correct_with(mut self, plan: Vec<Action>) -> Self {
        self.fallback_correction = Some(plan);
        self
    }

    pub fn plan_calls(&self) -> u32 {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn replan_calls(&self) -> u32 {
        self.replan_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _instruction: &str, _ui: &UiSnapshot) -> Result<Vec<Action>, TaskError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.plans.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        scripted.unwrap_or_else(|| Ok(self.default_plan.clone()))
    }

    async fn replan(
        &self,
        _instruction: &str,
        _ui: Option<&UiSnapshot>,
        _failed_action: Option<&Action>,
        _error: &TaskError,
    ) -> Result<Option<Vec<Action>>, TaskError> {
        self.replan_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.corrections.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        Ok(scripted.unwrap_or_else(|| self.fallback_correction.clone()))
    }
}

/// 按 element 参数脚本化结果的动作 handler
pub struct ScriptedHandler {
    kind: String,
    scripts: Mutex<HashMap<String, VecDeque<Result<(), TaskError>>>>,
    always: Mutex<HashMap<String, TaskError>>,
    delay: Duration,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedHandler {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scripts: Mutex::new(HashMap::new()),
            always: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// 对该 element 依次返回这些结果，之后成功
    pub fn script(self, element: &str, results: Vec<Result<(), TaskError>>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(element.to_string(), results.into());
        self
    }

    pub fn fail_times(self, element: &str, times: usize, err: TaskError) -> Self {
        let results = (0..times).map(|_| Err(err.clone())).collect();
        self.script(element, results)
    }

    /// 脚本耗尽后对该 element 始终失败
    pub fn always_fail(self, element: &str, err: TaskError) -> Self {
        self.always
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(element.to_string(), err);
        self
    }

    /// 每次执行前等待（模拟慢设备）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls_for(&self, element: &str) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(element)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).values().sum()
    }
}

#[async_trait]
impl ActionHandler for ScriptedHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn description(&self) -> &str {
        "scripted action"
    }

    async fn perform(&self, action: &Action, _target: &ExecutionTarget) -> Result<(), TaskError> {
        let key = element_key(action);
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&key)
            .and_then(|q| q.pop_front());
        if let Some(result) = scripted {
            return result;
        }
        match self.always.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// 演示用：固定延迟，每 fail_every 次失败一次（0 表示从不失败）
pub struct SimulatedHandler {
    kind: String,
    latency: Duration,
    fail_every: u32,
    counter: AtomicU32,
}

impl SimulatedHandler {
    pub fn new(kind: impl Into<String>, latency: Duration, fail_every: u32) -> Self {
        Self {
            kind: kind.into(),
            latency,
            fail_every,
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ActionHandler for SimulatedHandler {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn description(&self) -> &str {
        "simulated device action"
    }

    async fn perform(&self, action: &Action, target: &ExecutionTarget) -> Result<(), TaskError> {
        tokio::time::sleep(self.latency).await;
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(TaskError::element(format!(
                "{} on {} did not respond",
                action, target.id
            )));
        }
        Ok(())
    }
}

/// 演示用的整套协作方：登录页感知、三步登录计划、模拟的 tap / type_text / swipe / back
pub fn demo_collaborators() -> Collaborators {
    let mut registry = ActionRegistry::new();
    registry.register(SimulatedHandler::new("tap", Duration::from_millis(80), 4));
    registry.register(SimulatedHandler::new("type_text", Duration::from_millis(120), 0));
    registry.register(SimulatedHandler::new("swipe", Duration::from_millis(100), 0));
    registry.register(SimulatedHandler::new("back", Duration::from_millis(50), 0));

    Collaborators::new(
        Arc::new(ScriptedPerception::login_screen()),
        Arc::new(ScriptedPlanner::new(login_plan()).always_correct_with(vec![
            Action::new("back", serde_json::Value::Null),
            Action::new("tap", json!({"element": "login_button"})),
        ])),
        Arc::new(ActionExecutor::new(registry)),
    )
}

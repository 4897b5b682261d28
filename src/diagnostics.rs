//! 诊断上下文
//!
//! 日志接收器与失败追踪接收器作为对象传给 `Collection`，
//! 内部事件另外通过 `tracing` 输出。

use std::sync::Arc;

/// 加载进度回调：`(当前位置, 最大位置, 插件名)`，返回 `false` 取消
pub type ProgressCallback<'a> = &'a mut dyn FnMut(u32, u32, &str) -> bool;

pub trait Diagnostics: Send + Sync {
    /// 日志消息
    fn message(&self, text: &str);

    /// 操作失败时收到失败的操作名
    fn raise(&self, operation: &str);
}

/// 什么都不做
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn message(&self, _text: &str) {}

    fn raise(&self, _operation: &str) {}
}

/// 消息输出到标准输出，不追踪失败
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutDiagnostics;

impl Diagnostics for StdoutDiagnostics {
    fn message(&self, text: &str) {
        println!("{}", text);
    }

    fn raise(&self, _operation: &str) {}
}

type Sink = Box<dyn Fn(&str) + Send + Sync>;

/// 调用方提供的回调
#[derive(Default)]
pub struct CallbackDiagnostics {
    on_message: Option<Sink>,
    on_raise: Option<Sink>,
}

impl CallbackDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_raise(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_raise = Some(Box::new(f));
        self
    }

    pub fn into_shared(self) -> Arc<dyn Diagnostics> {
        Arc::new(self)
    }
}

impl Diagnostics for CallbackDiagnostics {
    fn message(&self, text: &str) {
        if let Some(f) = &self.on_message {
            f(text);
        }
    }

    fn raise(&self, operation: &str) {
        if let Some(f) = &self.on_raise {
            f(operation);
        }
    }
}

impl std::fmt::Debug for CallbackDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDiagnostics")
            .field("on_message", &self.on_message.is_some())
            .field("on_raise", &self.on_raise.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_callbacks_receive_events() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let raised = Arc::new(Mutex::new(Vec::new()));

        let m = messages.clone();
        let r = raised.clone();
        let diagnostics = CallbackDiagnostics::new()
            .on_message(move |text| m.lock().unwrap().push(text.to_string()))
            .on_raise(move |op| r.lock().unwrap().push(op.to_string()))
            .into_shared();

        diagnostics.message("loaded A.esp");
        diagnostics.raise("save");
        assert_eq!(*messages.lock().unwrap(), vec!["loaded A.esp"]);
        assert_eq!(*raised.lock().unwrap(), vec!["save"]);
    }
}

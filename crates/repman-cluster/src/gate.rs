//! 动作闸门模块
//!
//! 所有修改性操作的统一入口: 一把按集群划分的互斥锁加上
//! `in_failover` / `in_maintenance` 标志。只读操作不经过闸门。

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::GateRejection;

/// 需要经过闸门的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Switchover,
    Failover,
    ToggleServerMaintenance,
    ToggleClusterMaintenance,
}

impl Action {
    /// 是否会改变主库
    pub fn promotes(&self) -> bool {
        matches!(self, Action::Switchover | Action::Failover)
    }
}

/// 判定时需要的外部信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateContext {
    /// 调用方是否被授权(API 层已校验 token)
    pub permitted: bool,
    /// 全局 split-brain 标志
    pub split_brain: bool,
    /// 本监控进程是否处于 Active
    pub active: bool,
}

impl Default for GateContext {
    fn default() -> Self {
        Self {
            permitted: true,
            split_brain: false,
            active: true,
        }
    }
}

/// 集群动作闸门
#[derive(Debug, Default)]
pub struct ActionGate {
    lock: Mutex<()>,
    in_failover: AtomicBool,
    in_maintenance: AtomicBool,
}

impl ActionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 判定动作能否执行,不获取任何标志
    pub fn check(&self, action: Action, ctx: &GateContext) -> Result<(), GateRejection> {
        if !ctx.permitted {
            return Err(GateRejection::NotPermitted(format!("{:?} not granted", action)));
        }
        if self.in_failover() {
            return Err(GateRejection::InFailover);
        }
        if action.promotes() {
            if self.in_maintenance() {
                return Err(GateRejection::InMaintenance);
            }
            if ctx.split_brain {
                return Err(GateRejection::SplitBrain);
            }
            if action == Action::Failover && !ctx.active {
                return Err(GateRejection::NotPermitted("supervisor is standby".to_string()));
            }
        }
        Ok(())
    }

    /// `Try(action)` 形式: 返回 (是否放行, 原因)
    pub fn try_action(&self, action: Action, ctx: &GateContext) -> (bool, String) {
        match self.check(action, ctx) {
            Ok(()) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        }
    }

    /// CAS 获取 in_failover 标志,守卫析构时清除
    pub fn enter_failover(&self) -> Result<FailoverGuard<'_>, GateRejection> {
        self.in_failover
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GateRejection::InFailover)?;
        debug!("in_failover flag acquired");
        Ok(FailoverGuard { gate: self })
    }

    /// 串行化其它修改性操作
    pub async fn serialize(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub fn in_failover(&self) -> bool {
        self.in_failover.load(Ordering::Acquire)
    }

    pub fn in_maintenance(&self) -> bool {
        self.in_maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, on: bool) {
        self.in_maintenance.store(on, Ordering::Release);
    }
}

/// in_failover 标志守卫
#[derive(Debug)]
pub struct FailoverGuard<'a> {
    gate: &'a ActionGate,
}

impl Drop for FailoverGuard<'_> {
    fn drop(&mut self) {
        self.gate.in_failover.store(false, Ordering::Release);
        debug!("in_failover flag released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_exclusive_and_released() {
        let gate = ActionGate::new();
        {
            let _guard = gate.enter_failover().unwrap();
            assert!(gate.in_failover());
            assert_eq!(gate.enter_failover().unwrap_err(), GateRejection::InFailover);
            assert_eq!(
                gate.check(Action::Switchover, &GateContext::default()),
                Err(GateRejection::InFailover)
            );
        }
        assert!(!gate.in_failover());
        assert!(gate.enter_failover().is_ok());
    }

    #[test]
    fn test_flag_released_on_panic() {
        let gate = std::sync::Arc::new(ActionGate::new());
        let g = gate.clone();
        let result = std::thread::spawn(move || {
            let _guard = g.enter_failover().unwrap();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        assert!(!gate.in_failover());
    }

    #[test]
    fn test_rejections() {
        let gate = ActionGate::new();
        let ctx = GateContext::default();
        assert!(gate.check(Action::Failover, &ctx).is_ok());

        let denied = GateContext { permitted: false, ..ctx };
        assert!(matches!(gate.check(Action::Failover, &denied), Err(GateRejection::NotPermitted(_))));

        let split = GateContext { split_brain: true, ..ctx };
        assert_eq!(gate.check(Action::Failover, &split), Err(GateRejection::SplitBrain));
        assert!(gate.check(Action::ToggleServerMaintenance, &split).is_ok());

        let standby = GateContext { active: false, ..ctx };
        assert!(gate.check(Action::Switchover, &standby).is_ok());
        assert!(gate.check(Action::Failover, &standby).is_err());

        gate.set_maintenance(true);
        assert_eq!(gate.check(Action::Switchover, &ctx), Err(GateRejection::InMaintenance));
        let (ok, reason) = gate.try_action(Action::Failover, &ctx);
        assert!(!ok);
        assert_eq!(reason, "cluster is in maintenance");
    }

    #[tokio::test]
    async fn test_serialize() {
        let gate = ActionGate::new();
        let guard = gate.serialize().await;
        assert!(gate.lock.try_lock().is_err());
        drop(guard);
        assert!(gate.lock.try_lock().is_ok());
    }
}

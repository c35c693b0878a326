//! # 会话上下文
//!
//! 加载登记表（LoadingRegistry）与一次性提示去重集合都是“会话级”状态：
//! 由引擎显式持有，会话结束时统一清空，不使用全局变量。
//!
//! 每次开始加载都会分配一个递增的 ticket。登记表只在 ticket 匹配时才移除条目，
//! 因此被新加载取代的旧请求在结束时既不会误删新条目，也不会重复触发。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// 会话级可变状态
#[derive(Debug, Default)]
pub struct SessionContext {
    loading: HashMap<String, u64>,
    notified: HashSet<(String, &'static str)>,
    next_ticket: u64,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loading(&self, shape_id: &str) -> bool {
        self.loading.contains_key(shape_id)
    }

    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }

    /// 登记一次加载并返回 ticket；已有登记时直接取代。
    pub fn begin_load(&mut self, shape_id: &str) -> u64 {
        self.next_ticket += 1;
        self.loading.insert(shape_id.to_string(), self.next_ticket);
        self.next_ticket
    }

    /// ticket 是否仍是该形状当前有效的加载。
    pub fn is_current(&self, shape_id: &str, ticket: u64) -> bool {
        self.loading.get(shape_id) == Some(&ticket)
    }

    /// 结束加载；只有 ticket 匹配时才会移除登记。
    pub fn finish_load(&mut self, shape_id: &str, ticket: u64) -> bool {
        if self.is_current(shape_id, ticket) {
            self.loading.remove(shape_id);
            return true;
        }
        false
    }

    /// 取消形状的在途加载，迟到的结果将被视为过期。
    pub fn cancel_load(&mut self, shape_id: &str) -> bool {
        self.loading.remove(shape_id).is_some()
    }

    /// 标记一次性提示；首次标记返回 `true`。
    pub fn mark_notified(&mut self, shape_id: &str, code: &'static str) -> bool {
        self.notified.insert((shape_id.to_string(), code))
    }

    pub fn clear_shape(&mut self, shape_id: &str) {
        self.loading.remove(shape_id);
        self.notified.retain(|(id, _)| id != shape_id);
    }

    /// 会话结束：清空全部登记。
    pub fn clear(&mut self) {
        self.loading.clear();
        self.notified.clear();
    }
}

/// 加载登记的 RAII 守卫
///
/// 离开作用域时结束登记（成功、失败、超时或 future 被丢弃都会经过这里），
/// 保证每次加载恰好清理一次。
pub(crate) struct LoadingGuard<'a> {
    session: &'a Mutex<SessionContext>,
    shape_id: String,
    ticket: u64,
}

impl<'a> LoadingGuard<'a> {
    pub(crate) fn new(session: &'a Mutex<SessionContext>, shape_id: &str, ticket: u64) -> Self {
        Self {
            session,
            shape_id: shape_id.to_string(),
            ticket,
        }
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        match self.session.lock() {
            Ok(mut session) => {
                if session.finish_load(&self.shape_id, self.ticket) {
                    log::debug!("🧹 加载登记已清除 - shape={} ticket={}", self.shape_id, self.ticket);
                }
            }
            Err(_) => log::error!("❌ 会话锁已中毒，无法清除加载登记 - shape={}", self.shape_id),
        }
    }
}

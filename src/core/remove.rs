//! 可中断的递归删除
//!
//! 删除集合时服务端在处理过程中不断返回状态，客户端每次回复后才继续。
//! [`RemoveTree`] 把每次往返作为迭代器的一项，调用方可以在两项之间停止。

use crate::error::{StoreError, TransferError};
use crate::remote::{CollectionStatus, LockedSession, StoreConnection, StoreOptions};
use tracing::{debug, warn};

/// 递归删除的状态流
///
/// 迭代结束时连接归还连接池；中途放弃（[`abandon`](Self::abandon) 或析构）
/// 时连接处于协议中间状态，直接断开丢弃。
pub struct RemoveTree {
    session: LockedSession,
    conn: Option<Box<dyn StoreConnection>>,
    path: String,
    round_trips: usize,
}

/// 发送删除请求并返回状态流
pub fn remove_tree(
    session: &LockedSession,
    path: &str,
    recursive: bool,
    force: bool,
) -> Result<RemoveTree, TransferError> {
    let options = StoreOptions {
        recursive,
        force,
        ..StoreOptions::default()
    };

    let mut conn = session.checkout_connection()?;
    if let Err(e) = conn.send_remove_collection(path, &options) {
        if matches!(e, StoreError::Transport(_)) {
            conn.disconnect();
        } else {
            session.release_connection(conn);
        }
        return Err(e.into());
    }

    debug!("开始删除集合: {}", path);
    Ok(RemoveTree {
        session: session.clone(),
        conn: Some(conn),
        path: path.to_string(),
        round_trips: 0,
    })
}

impl RemoveTree {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 已完成的状态往返次数
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    pub fn is_finished(&self) -> bool {
        self.conn.is_none()
    }

    /// 放弃删除，断开并丢弃连接
    pub fn abandon(mut self) {
        self.discard();
    }

    /// 一直执行到结束，返回往返次数
    pub fn run(mut self) -> Result<usize, TransferError> {
        for step in self.by_ref() {
            step?;
        }
        Ok(self.round_trips)
    }

    fn discard(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            warn!("删除 {} 未完成，丢弃连接", self.path);
            conn.disconnect();
        }
    }
}

impl Iterator for RemoveTree {
    type Item = Result<(), TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        let conn = self.conn.as_mut()?;

        let result = conn.recv_status().and_then(|status| match status {
            CollectionStatus::InProgress => conn.reply_status().map(|()| true),
            CollectionStatus::Finished => Ok(false),
        });

        match result {
            Ok(true) => {
                self.round_trips += 1;
                Some(Ok(()))
            }
            Ok(false) => {
                if let Some(conn) = self.conn.take() {
                    self.session.release_connection(conn);
                }
                debug!("集合已删除: {} ({} 次往返)", self.path, self.round_trips);
                None
            }
            Err(e) => {
                self.discard();
                Some(Err(e.into()))
            }
        }
    }
}

impl Drop for RemoveTree {
    fn drop(&mut self) {
        self.discard();
    }
}

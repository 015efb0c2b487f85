//! 远程路径工具（远程路径统一使用 `/` 分隔）

/// 规范化路径：去掉空段和 `.`，处理 `..`，结果总是以 `/` 开头
pub fn normpath(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }

    format!("/{}", parts.join("/"))
}

pub fn join(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// 拆分为 (父路径, 名称)
pub fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

pub fn basename(path: &str) -> &str {
    split(path.trim_end_matches('/')).1
}

pub fn dirname(path: &str) -> &str {
    split(path.trim_end_matches('/')).0
}

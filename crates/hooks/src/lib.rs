//! The command-hook layer.
//!
//! A command filter inspects every client command. When a registered
//! hook matches, either by command name alone (movable-keys commands)
//! or by command name plus a key argument carrying a registered
//! prefix, the filter rewrites the call to the internal hook command,
//! whose handler runs the registered callback with the original
//! arguments under the recursion / replication / memory guards.

use bytes::Bytes;
use engine::Engine;
use fxhash::FxHashMap;
use host::{CallContext, CommandInfo, Host, Reply};
use parking_lot::RwLock;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Internal command the filter rewrites hooked calls into:
/// `sluice.innerhook <hook-id> <original argv...>`.
pub const INNER_HOOK_COMMAND: &str = "sluice.innerhook";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("command '{0}' is marked noscript and cannot be hooked")]
    Noscript(String),
    #[error("command '{0}' has movable keys; prefix hooks are not allowed")]
    MovableKeys(String),
    #[error("command '{0}' key spec does not allow prefix hooks")]
    BadKeySpec(String),
    #[error("hook {0} not found")]
    HookNotFound(u64),
}

thread_local! {
    // Per-thread recursion guard: while a hook callback runs, the
    // filter must not rewrite commands it issues.
    static NO_FILTER: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard suppressing filter rewrites on this thread.
pub struct NoFilterGuard {
    prev: bool,
}

impl NoFilterGuard {
    pub fn new() -> NoFilterGuard {
        let prev = NO_FILTER.with(|f| f.replace(true));
        NoFilterGuard { prev }
    }
}

impl Default for NoFilterGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoFilterGuard {
    fn drop(&mut self) {
        NO_FILTER.with(|f| f.set(self.prev));
    }
}

pub fn filtering_suppressed() -> bool {
    NO_FILTER.with(Cell::get)
}

/// What a hook callback produced: an immediate reply, or nothing
/// because it took ownership of the blocked client.
pub enum HookOutcome {
    Reply(Reply),
    Blocked,
}

pub type HookFn =
    Arc<dyn Fn(&Engine, &mut CallContext, &CommandHook) -> HookOutcome + Send + Sync>;

pub struct CommandHook {
    pub id: u64,
    pub command: String,
    pub prefix: Option<Bytes>,
    pub info: CommandInfo,
    callback: HookFn,
}

impl CommandHook {
    /// Key argument positions of `argv` under this hook's stored
    /// `(firstKey, lastKey, jump)` triple.
    pub fn key_positions(&self, argc: usize) -> Vec<usize> {
        let CommandInfo {
            first_key,
            last_key,
            jump,
            ..
        } = self.info;
        if first_key <= 0 || jump <= 0 {
            return Vec::new();
        }
        let last = if last_key < 0 {
            (argc as i64 + last_key as i64) as usize
        } else {
            last_key as usize
        };
        (first_key as usize..=last.min(argc.saturating_sub(1)))
            .step_by(jump as usize)
            .collect()
    }

    fn matches(&self, argv: &[Bytes]) -> bool {
        let Some(prefix) = &self.prefix else {
            // Movable-keys case: the name alone decides.
            return true;
        };
        self.key_positions(argv.len())
            .into_iter()
            .any(|pos| argv.get(pos).is_some_and(|key| key.starts_with(prefix)))
    }
}

impl std::fmt::Debug for CommandHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHook")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[derive(Default)]
struct Tables {
    hooks: FxHashMap<u64, Arc<CommandHook>>,
    by_command: FxHashMap<String, Vec<u64>>,
}

/// Registry of command hooks plus the installed filter.
pub struct HookRegistry {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Arc<HookRegistry> {
        Arc::new(HookRegistry {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Install the command filter into the host. Called once at load.
    pub fn install(self: &Arc<Self>, host: &Arc<dyn Host>) {
        let registry = self.clone();
        host.register_command_filter(Box::new(move |argv| registry.filter(argv)));
    }

    /// Validate and register a hook over `command`.
    pub fn register_hook(
        &self,
        host: &dyn Host,
        command: &str,
        prefix: Option<Bytes>,
        callback: HookFn,
    ) -> Result<u64, Error> {
        let name = command.to_ascii_lowercase();
        let info = host
            .command_info(&name)
            .ok_or_else(|| Error::UnknownCommand(name.clone()))?;
        if info.noscript {
            return Err(Error::Noscript(name));
        }
        if prefix.is_some() {
            if info.movable_keys {
                return Err(Error::MovableKeys(name));
            }
            if info.first_key <= 0 || info.jump <= 0 {
                return Err(Error::BadKeySpec(name));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let hook = Arc::new(CommandHook {
            id,
            command: name.clone(),
            prefix,
            info,
            callback,
        });
        let mut tables = self.tables.write();
        tables.hooks.insert(id, hook);
        tables.by_command.entry(name).or_default().push(id);
        Ok(id)
    }

    pub fn unregister_hook(&self, id: u64) -> bool {
        let mut tables = self.tables.write();
        let Some(hook) = tables.hooks.remove(&id) else {
            return false;
        };
        if let Some(ids) = tables.by_command.get_mut(&hook.command) {
            ids.retain(|h| *h != id);
        }
        true
    }

    pub fn hook(&self, id: u64) -> Option<Arc<CommandHook>> {
        self.tables.read().hooks.get(&id).cloned()
    }

    /// The filter body: rewrite a matching call into the internal hook
    /// command. Replicated traffic never reaches this (the host
    /// forwards it via direct invocation) and a thread inside a hook
    /// callback is exempted by the recursion guard.
    pub fn filter(&self, argv: &mut Vec<Bytes>) {
        if filtering_suppressed() || argv.is_empty() {
            return;
        }
        let Some(name) = std::str::from_utf8(&argv[0]).ok() else {
            return;
        };
        let name = name.to_ascii_lowercase();
        if name == INNER_HOOK_COMMAND {
            return;
        }
        let tables = self.tables.read();
        let Some(ids) = tables.by_command.get(&name) else {
            return;
        };
        let Some(hook) = ids
            .iter()
            .filter_map(|id| tables.hooks.get(id))
            .find(|hook| hook.matches(argv))
        else {
            return;
        };
        let mut rewritten = Vec::with_capacity(argv.len() + 2);
        rewritten.push(Bytes::from_static(INNER_HOOK_COMMAND.as_bytes()));
        rewritten.push(Bytes::from(hook.id.to_string()));
        rewritten.append(argv);
        *argv = rewritten;
        tracing::trace!(hook = hook.id, command = %name, "rewrote hooked command");
    }

    /// Handler of the internal hook command. `ctx.args` are
    /// `[sluice.innerhook, hook-id, original argv...]`.
    pub fn handle_inner_hook(&self, engine: &Engine, ctx: &mut CallContext) -> Reply {
        if ctx.args.len() < 3 {
            return Reply::wrong_arity(INNER_HOOK_COMMAND);
        }
        let Some(id) = ctx.arg_str(1).and_then(|s| s.parse::<u64>().ok()) else {
            return Reply::error("malformed hook id");
        };
        let Some(hook) = self.hook(id) else {
            return Reply::error(format!("hook {id} is gone"));
        };

        // Strip the rewrite; callbacks see the original argv with the
        // calling client still attached.
        ctx.args = ctx.args.split_off(2);

        // Replication/loading bypass: the original command is
        // forwarded via direct invocation instead of the callback.
        if ctx.from_replica || engine.host().is_loading() {
            return engine.host().call(&ctx.args);
        }

        // Memory guard: deny-oom commands are refused above the
        // store's maxmemory ratio.
        if hook.info.denyoom && engine.host().memory_ratio() > 1.0 {
            return Reply::error("OOM command not allowed when used memory > 'maxmemory'");
        }

        let _guard = NoFilterGuard::new();
        match (hook.callback)(engine, ctx, &hook) {
            HookOutcome::Reply(reply) => reply,
            HookOutcome::Blocked => Reply::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(first: i32, last: i32, jump: i32) -> CommandInfo {
        CommandInfo {
            noscript: false,
            denyoom: false,
            movable_keys: false,
            write: true,
            first_key: first,
            last_key: last,
            jump,
        }
    }

    fn hook_with(prefix: Option<&str>, first: i32, last: i32, jump: i32) -> CommandHook {
        CommandHook {
            id: 1,
            command: "set".into(),
            prefix: prefix.map(|p| Bytes::copy_from_slice(p.as_bytes())),
            info: info(first, last, jump),
            callback: Arc::new(|_, _, _| HookOutcome::Reply(Reply::ok())),
        }
    }

    #[test]
    fn key_positions_follow_the_stored_triple() {
        // SET key value: first=1 last=1 jump=1.
        assert_eq!(hook_with(None, 1, 1, 1).key_positions(3), vec![1]);
        // MSET k v k v: first=1 last=-1 jump=2.
        assert_eq!(hook_with(None, 1, -1, 2).key_positions(5), vec![1, 3]);
        // No keys declared.
        assert_eq!(hook_with(None, 0, 0, 0).key_positions(3), Vec::<usize>::new());
    }

    #[test]
    fn prefix_match_consults_key_arguments_only() {
        let hook = hook_with(Some("foo"), 1, 1, 1);
        let matching = vec![
            Bytes::from_static(b"set"),
            Bytes::from_static(b"foo1"),
            Bytes::from_static(b"1"),
        ];
        let non_matching = vec![
            Bytes::from_static(b"set"),
            Bytes::from_static(b"bar"),
            // A value starting with the prefix must not match.
            Bytes::from_static(b"foo"),
        ];
        assert!(hook.matches(&matching));
        assert!(!hook.matches(&non_matching));
    }

    #[test]
    fn no_filter_guard_nests() {
        assert!(!filtering_suppressed());
        {
            let _outer = NoFilterGuard::new();
            assert!(filtering_suppressed());
            {
                let _inner = NoFilterGuard::new();
                assert!(filtering_suppressed());
            }
            assert!(filtering_suppressed());
        }
        assert!(!filtering_suppressed());
    }
}

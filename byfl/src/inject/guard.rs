//! Mutual exclusion around counter updates.
//!
//! In thread-safe mode every injected sequence that touches a counter runs
//! between `bf_acquire_mega_lock` and `bf_release_mega_lock`.
use byinstr::modules::{instructions::Instr, misc::Call};

use crate::{inject::Declarations, magic::Routine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    enabled: bool,
}

impl Guard {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn routine_call(routine: Routine, decls: &mut Declarations) -> Instr {
        Call {
            dest: None,
            ty: None,
            function: decls.routine(routine),
            args: vec![],
        }
        .into()
    }

    /// Lock acquisition, if enabled.
    pub fn acquire(&self, decls: &mut Declarations) -> Option<Instr> {
        self.enabled
            .then(|| Self::routine_call(Routine::AcquireMegaLock, decls))
    }

    /// Lock release, if enabled.
    pub fn release(&self, decls: &mut Declarations) -> Option<Instr> {
        self.enabled
            .then(|| Self::routine_call(Routine::ReleaseMegaLock, decls))
    }

    /// `code` between an acquire and a release. Empty sequences stay empty.
    pub fn wrap(&self, code: Vec<Instr>, decls: &mut Declarations) -> Vec<Instr> {
        if !self.enabled || code.is_empty() {
            return code;
        }
        let mut wrapped = Vec::with_capacity(code.len() + 2);
        wrapped.extend(self.acquire(decls));
        wrapped.extend(code);
        wrapped.extend(self.release(decls));
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use byinstr::{consts::AnyConst, modules::operand::Operand};

    use super::*;

    fn callee(instr: &Instr) -> Option<&str> {
        match instr {
            Instr::Call(call) => call.callee(),
            _ => None,
        }
    }

    #[test]
    fn disabled_guard_is_transparent() {
        let mut decls = Declarations::new();
        let code = vec![Instr::from(Call {
            dest: None,
            ty: None,
            function: Operand::Function("bf_pop_function".to_string()),
            args: vec![],
        })];
        let wrapped = Guard::new(false).wrap(code.clone(), &mut decls);
        assert_eq!(wrapped, code);
        assert_eq!(decls.routines().count(), 0);
    }

    #[test]
    fn enabled_guard_brackets_code() {
        let mut decls = Declarations::new();
        let guard = Guard::new(true);
        assert!(guard.wrap(vec![], &mut decls).is_empty());

        let code = vec![Instr::from(Call {
            dest: None,
            ty: None,
            function: Operand::Function("bf_accumulate_bb_tallies".to_string()),
            args: vec![AnyConst::i64(1).into()],
        })];
        let wrapped = guard.wrap(code, &mut decls);
        let names: Vec<_> = wrapped.iter().filter_map(callee).collect();
        assert_eq!(
            names,
            vec![
                "bf_acquire_mega_lock",
                "bf_accumulate_bb_tallies",
                "bf_release_mega_lock"
            ]
        );
        assert_eq!(decls.routines().count(), 2);
    }
}

use crate::value::Value;

/// The register file.  Kept apart from the stack so a continuation can
/// snapshot and restore both wholesale.
#[derive(Clone)]
pub struct ThreadRegs {
    /// Byte offset into the code vector.
    pub pc: usize,
    /// Last computed expression.
    pub val: Value,
    /// The callable being invoked.
    pub func: Value,
    pub reg1: Value,
    pub reg2: Value,
    /// Current activation's slot vector, or nil at toplevel.
    pub frame: Value,
    pub module: Value,
    pub input: Value,
    pub output: Value,
    pub error: Value,
    /// Tops of the domain-specific sub-stacks threaded through the main
    /// stack; -1 when empty.
    pub trap_sp: i64,
    pub dynamic_sp: i64,
    pub environ_sp: i64,
}

/// An execution context.  Not itself a heap value: the runtime owns the
/// running thread directly, and a continuation carries a copy of it.
pub struct RtThread {
    pub regs: ThreadRegs,
    pub stack: Vec<Value>,
}

impl RtThread {
    pub fn new() -> RtThread {
        RtThread {
            regs: ThreadRegs {
                pc: 0,
                val: Value::Unspec,
                func: Value::Unspec,
                reg1: Value::Unspec,
                reg2: Value::Unspec,
                frame: Value::Nil,
                module: Value::Nil,
                input: Value::Nil,
                output: Value::Nil,
                error: Value::Nil,
                trap_sp: -1,
                dynamic_sp: -1,
                environ_sp: -1,
            },
            stack: Vec::with_capacity(64),
        }
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => panic!("thread stack underflow"),
        }
    }

    pub fn peek(&self) -> Option<Value> {
        self.stack.last().copied()
    }

    /// Wholesale reset: the reset meta-handler's last resort.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.regs.val = Value::Unspec;
        self.regs.func = Value::Unspec;
        self.regs.reg1 = Value::Unspec;
        self.regs.reg2 = Value::Unspec;
        self.regs.frame = Value::Nil;
        self.regs.trap_sp = -1;
        self.regs.dynamic_sp = -1;
        self.regs.environ_sp = -1;
    }
}

impl Default for RtThread {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop() {
        let mut t = RtThread::new();
        t.push(Value::Fixnum(1));
        t.push(Value::True);
        assert_eq!(t.peek(), Some(Value::True));
        assert_eq!(t.pop(), Value::True);
        assert_eq!(t.pop(), Value::Fixnum(1));
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn pop_empty_is_a_defect() {
        let mut t = RtThread::new();
        t.pop();
    }

    #[test]
    fn reset_clears_execution_state() {
        let mut t = RtThread::new();
        t.push(Value::Fixnum(1));
        t.regs.trap_sp = 0;
        t.reset();
        assert!(t.stack.is_empty());
        assert_eq!(t.regs.trap_sp, -1);
        assert_eq!(t.regs.val, Value::Unspec);
    }
}

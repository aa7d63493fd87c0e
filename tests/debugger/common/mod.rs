//! In-memory GemStone for integration tests.
//!
//! `FakeGem` keeps objects, classes, methods and suspended processes in a map and answers
//! the messages the client sends. Source evaluation understands integer literals,
//! `self`, `self <unary>`, `<Class> new <unary>` and sources scripted with
//! [`FakeGem::script`].
#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use gemstalker::debugger::{EventHook, StopReason};
use gemstalker::exec::{PollConfig, ProgressSink};
use gemstalker::gci::error::{ERR_COMPILE, ERR_DOES_NOT_UNDERSTAND, ERR_HARD_BREAK, ERR_SOFT_BREAK};
use gemstalker::gci::traversal::{IdxSizeBits, ObjImpl, ObjectReport, TraversalStatus};
use gemstalker::gci::{
    ClampedTravArgs, CompileRequest, ErrorRecord, ExecRequest, Gci, GciError, GemSession,
    LoginParams, ObjInfo, Oop, PerformRequest, PollStatus, SessionHandle, SessionRegistry,
    TraversalBuffer, Utf8Fetch,
};
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const FAKE_VERSION: &str = "3.7.1 build 64bit-fake";
const ERR_NOT_FOUND: i32 = 2101;
const ERR_BAD_ARGUMENT: i32 = 2003;
const ERR_LOGIN: i32 = 4051;
/// Number of polls that never finish.
const HANG: u32 = u32::MAX;

/// Scripted answer to an evaluated source.
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Oop),
    Error(i32, String),
    /// Error that leaves `process` suspended.
    Suspend(i32, String, Oop),
}

#[derive(Debug, Clone)]
pub struct FakeFrame {
    pub method: Oop,
    /// Step point of the frame, answered as its ip offset.
    pub step_point: i64,
    pub receiver: Oop,
    pub names: Vec<&'static str>,
    pub values: Vec<Oop>,
}

/// What happens when a suspended process is continued.
#[derive(Debug, Clone)]
pub enum Resume {
    Stop {
        number: i32,
        message: String,
        frames: Option<Vec<FakeFrame>>,
    },
    Complete(Oop),
}

struct ClassData {
    name: String,
    inst_vars: Vec<String>,
    methods: HashMap<(String, u16), Oop>,
    meta: Option<Oop>,
    bytes: bool,
}

struct MethodData {
    class: Oop,
    selector: String,
    source: String,
    /// 0-based, answered 1-based like the VM does.
    step_offsets: Vec<usize>,
    breaks: Vec<i64>,
    result: Oop,
    broken: bool,
    /// Clearing and setting breaks fails.
    locked: bool,
}

struct ProcessData {
    frames: Vec<FakeFrame>,
    resume: VecDeque<Resume>,
    armed: Option<(String, i64)>,
    /// Levels whose contents can not be fetched.
    unreadable: HashSet<i64>,
}

#[derive(Default)]
enum Body {
    #[default]
    Plain,
    Class(ClassData),
    Method(MethodData),
    Process(ProcessData),
    Dictionary(IndexMap<String, Oop>),
}

struct Obj {
    class: Oop,
    named: Vec<Oop>,
    indexed: Vec<Oop>,
    bytes: Option<Vec<u8>>,
    print: Option<String>,
    body: Body,
}

impl Default for Obj {
    fn default() -> Self {
        Self {
            class: Oop::NIL,
            named: vec![],
            indexed: vec![],
            bytes: None,
            print: None,
            body: Body::Plain,
        }
    }
}

struct Pending {
    reply: Result<Oop, GciError>,
    polls_left: u32,
}

struct State {
    next_oop: u64,
    objects: HashMap<Oop, Obj>,
    globals: IndexMap<String, Oop>,
    globals_dict: Oop,
    symbols: HashMap<String, Oop>,
    scripts: HashMap<String, Reply>,

    sessions: HashSet<usize>,
    next_session: usize,
    pending: Option<Pending>,
    nb_delay: u32,
    ignore_soft_break: bool,
    hard_break_hangs: bool,
    trav_more: Vec<ObjectReport>,

    calls: Vec<String>,
    cleared: Vec<Oop>,
}

fn vm_error(number: i32, message: impl Into<String>) -> GciError {
    GciError::from(ErrorRecord::new(number, message))
}

fn article(name: &str) -> &'static str {
    match name.chars().next() {
        Some(c) if "AEIOU".contains(c) => "an",
        _ => "a",
    }
}

fn int_arg(args: &[Oop], idx: usize) -> Result<i64, GciError> {
    args.get(idx)
        .and_then(|a| a.as_i64())
        .ok_or_else(|| vm_error(ERR_BAD_ARGUMENT, "expected a SmallInteger argument"))
}

impl State {
    fn new() -> Self {
        let mut state = Self {
            next_oop: 1000,
            objects: HashMap::new(),
            globals: IndexMap::new(),
            globals_dict: Oop::NIL,
            symbols: HashMap::new(),
            scripts: HashMap::new(),
            sessions: HashSet::new(),
            next_session: 1,
            pending: None,
            nb_delay: 0,
            ignore_soft_break: false,
            hard_break_hangs: false,
            trav_more: vec![],
            calls: vec![],
            cleared: vec![],
        };

        for (oop, name) in [
            (Oop::CLASS_SMALL_INTEGER, "SmallInteger"),
            (Oop::CLASS_CHARACTER, "Character"),
            (Oop::CLASS_BOOLEAN, "Boolean"),
            (Oop::CLASS_UNDEFINED_OBJECT, "UndefinedObject"),
            (Oop::CLASS_SMALL_DOUBLE, "SmallDouble"),
        ] {
            state.insert_class(oop, name, &[], false);
        }
        for name in ["Object", "Array", "GsProcess", "GsNMethod", "SymbolDictionary"] {
            state.define_class(name, &[], false);
        }
        for name in ["String", "Symbol"] {
            state.define_class(name, &[], true);
        }

        let dict_class = state.global("SymbolDictionary");
        let entries = state.globals.clone();
        state.globals_dict = state.alloc(Obj {
            class: dict_class,
            body: Body::Dictionary(entries),
            ..Default::default()
        });
        state.globals.insert("Globals".to_string(), state.globals_dict);
        state.globals.insert("UserGlobals".to_string(), state.globals_dict);
        state
    }

    fn alloc(&mut self, obj: Obj) -> Oop {
        let oop = Oop::from_raw((self.next_oop << 8) | 0x01);
        self.next_oop += 1;
        self.objects.insert(oop, obj);
        oop
    }

    fn global(&self, name: &str) -> Oop {
        self.globals.get(name).copied().unwrap_or(Oop::NIL)
    }

    fn insert_class(&mut self, oop: Oop, name: &str, inst_vars: &[&str], bytes: bool) {
        self.objects.insert(
            oop,
            Obj {
                class: Oop::NIL,
                body: Body::Class(ClassData {
                    name: name.to_string(),
                    inst_vars: inst_vars.iter().map(|s| s.to_string()).collect(),
                    methods: HashMap::new(),
                    meta: None,
                    bytes,
                }),
                ..Default::default()
            },
        );
        self.globals.insert(name.to_string(), oop);
        if let Some(Obj {
            body: Body::Dictionary(entries),
            ..
        }) = self.objects.get_mut(&self.globals_dict)
        {
            entries.insert(name.to_string(), oop);
        }
    }

    fn define_class(&mut self, name: &str, inst_vars: &[&str], bytes: bool) -> Oop {
        let oop = self.alloc(Obj::default());
        self.insert_class(oop, name, inst_vars, bytes);
        oop
    }

    fn obj(&self, oop: Oop) -> Result<&Obj, GciError> {
        self.objects
            .get(&oop)
            .ok_or_else(|| vm_error(ERR_NOT_FOUND, format!("object {oop:?} does not exist")))
    }

    fn obj_mut(&mut self, oop: Oop) -> Result<&mut Obj, GciError> {
        self.objects
            .get_mut(&oop)
            .ok_or_else(|| vm_error(ERR_NOT_FOUND, format!("object {oop:?} does not exist")))
    }

    fn class_data(&self, class: Oop) -> Option<&ClassData> {
        match self.objects.get(&class).map(|o| &o.body) {
            Some(Body::Class(data)) => Some(data),
            _ => None,
        }
    }

    fn class_of(&self, oop: Oop) -> Result<Oop, GciError> {
        if oop.is_special() {
            return Ok(oop.special_class());
        }
        Ok(self.obj(oop)?.class)
    }

    fn class_name(&self, class: Oop) -> String {
        self.class_data(class)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "Object".to_string())
    }

    fn new_bytes(&mut self, class_name: &str, s: &str) -> Oop {
        let class = self.global(class_name);
        self.alloc(Obj {
            class,
            bytes: Some(s.as_bytes().to_vec()),
            ..Default::default()
        })
    }

    fn symbol(&mut self, s: &str) -> Oop {
        if let Some(&oop) = self.symbols.get(s) {
            return oop;
        }
        let oop = self.new_bytes("Symbol", s);
        self.symbols.insert(s.to_string(), oop);
        oop
    }

    fn new_array(&mut self, oops: Vec<Oop>) -> Oop {
        let class = self.global("Array");
        self.alloc(Obj {
            class,
            indexed: oops,
            ..Default::default()
        })
    }

    fn string_of(&self, oop: Oop) -> Result<String, GciError> {
        match &self.obj(oop)?.bytes {
            Some(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            None => Err(vm_error(ERR_BAD_ARGUMENT, "expected a byte object")),
        }
    }

    fn print_of(&self, oop: Oop) -> String {
        if let Some(printed) = oop.kind().print_string() {
            return printed;
        }
        let Ok(obj) = self.obj(oop) else {
            return format!("<invalid {oop:?}>");
        };
        if let Some(print) = &obj.print {
            return print.clone();
        }
        if let Body::Class(data) = &obj.body {
            return data.name.clone();
        }
        let class_name = self.class_name(obj.class);
        match &obj.bytes {
            Some(bytes) if class_name == "Symbol" => format!("#{}", String::from_utf8_lossy(bytes)),
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes)),
            None => format!("{} {class_name}", article(&class_name)),
        }
    }

    fn bytes_or_print(&self, oop: Oop) -> Vec<u8> {
        match self.objects.get(&oop).and_then(|o| o.bytes.clone()) {
            Some(bytes) => bytes,
            None => self.print_of(oop).into_bytes(),
        }
    }

    fn dnu(&self, receiver: Oop, selector: &str) -> GciError {
        let class_name = self
            .class_of(receiver)
            .map(|c| self.class_name(c))
            .unwrap_or_default();
        vm_error(
            ERR_DOES_NOT_UNDERSTAND,
            format!("{} {class_name} does not understand #{selector}", article(&class_name)),
        )
    }

    // --------------------------------- evaluation ------------------------------------------------

    fn evaluate(&mut self, source: &str, context: Oop) -> Result<Oop, GciError> {
        if let Some(reply) = self.scripts.get(source).cloned() {
            return match reply {
                Reply::Value(oop) => Ok(oop),
                Reply::Error(number, message) => Err(vm_error(number, message)),
                Reply::Suspend(number, message, process) => {
                    Err(GciError::from(ErrorRecord::new(number, message).with_context(process)))
                }
            };
        }
        if let Ok(i) = source.trim().parse::<i64>() {
            return Oop::from_i64(i).ok_or_else(|| vm_error(ERR_BAD_ARGUMENT, "too large"));
        }

        let tokens: Vec<&str> = source.split_whitespace().collect();
        match tokens[..] {
            ["self"] => Ok(context),
            ["self", selector] => self.send(context, selector),
            [class_name, "new", selector] => {
                let class = self.global(class_name);
                if class.is_nil() {
                    return Err(vm_error(ERR_NOT_FOUND, format!("undefined symbol {class_name}")));
                }
                let instance = self.perform(class, "new", &[])?;
                self.send(instance, selector)
            }
            _ => Err(vm_error(ERR_COMPILE, format!("syntax error in {source:?}"))),
        }
    }

    /// Unary send, compiled methods first.
    fn send(&mut self, receiver: Oop, selector: &str) -> Result<Oop, GciError> {
        let class = self.class_of(receiver)?;
        let method = self
            .class_data(class)
            .and_then(|data| data.methods.get(&(selector.to_string(), 0)).copied());
        if let Some(method) = method {
            if let Body::Method(data) = &self.obj(method)?.body {
                return Ok(data.result);
            }
        }
        self.perform(receiver, selector, &[])
    }

    fn perform(&mut self, receiver: Oop, selector: &str, args: &[Oop]) -> Result<Oop, GciError> {
        if selector == "printString" {
            let printed = self.print_of(receiver);
            return Ok(self.new_bytes("String", &printed));
        }
        if receiver.is_special() {
            return Err(self.dnu(receiver, selector));
        }

        match &self.obj(receiver)?.body {
            Body::Class(_) => return self.perform_class(receiver, selector, args),
            Body::Method(_) => return self.perform_method(receiver, selector, args),
            Body::Process(_) => return self.perform_process(receiver, selector, args),
            Body::Dictionary(entries) if selector == "at:otherwise:" => {
                let key = self.string_of(args[0])?;
                return Ok(entries.get(&key).copied().unwrap_or(args[1]));
            }
            _ => {}
        }
        match selector {
            "class" => self.class_of(receiver),
            "yourself" => Ok(receiver),
            _ => Err(self.dnu(receiver, selector)),
        }
    }

    fn perform_class(&mut self, class: Oop, selector: &str, args: &[Oop]) -> Result<Oop, GciError> {
        let Some(data) = self.class_data(class) else {
            return Err(self.dnu(class, selector));
        };
        match selector {
            "name" => {
                let name = data.name.clone();
                Ok(self.symbol(&name))
            }
            "new" => {
                let named = vec![Oop::NIL; data.inst_vars.len()];
                let bytes = data.bytes.then(Vec::new);
                Ok(self.alloc(Obj {
                    class,
                    named,
                    bytes,
                    ..Default::default()
                }))
            }
            "allInstVarNames" => {
                let names = data.inst_vars.clone();
                let symbols = names.iter().map(|n| self.symbol(n)).collect();
                Ok(self.new_array(symbols))
            }
            "compiledMethodAt:environmentId:otherwise:" => {
                let selector = self.string_of(args[0])?;
                let env = int_arg(args, 1)? as u16;
                let data = self.class_data(class).ok_or_else(|| self.dnu(class, "methods"))?;
                Ok(data.methods.get(&(selector, env)).copied().unwrap_or(args[2]))
            }
            "removeAllMethods" => {
                if let Body::Class(data) = &mut self.obj_mut(class)?.body {
                    data.methods.clear();
                }
                Ok(class)
            }
            "class" => {
                if let Some(meta) = data.meta {
                    return Ok(meta);
                }
                let name = format!("{} class", data.name);
                let meta = self.alloc(Obj {
                    body: Body::Class(ClassData {
                        name,
                        inst_vars: vec![],
                        methods: HashMap::new(),
                        meta: None,
                        bytes: false,
                    }),
                    ..Default::default()
                });
                if let Body::Class(data) = &mut self.obj_mut(class)?.body {
                    data.meta = Some(meta);
                }
                Ok(meta)
            }
            _ => Err(self.dnu(class, selector)),
        }
    }

    fn method_data(&mut self, method: Oop) -> Result<&mut MethodData, GciError> {
        match &mut self.obj_mut(method)?.body {
            Body::Method(data) => Ok(data),
            _ => Err(vm_error(ERR_BAD_ARGUMENT, "expected a method")),
        }
    }

    fn perform_method(
        &mut self,
        method: Oop,
        selector: &str,
        args: &[Oop],
    ) -> Result<Oop, GciError> {
        let data = self.method_data(method)?;
        match selector {
            "inClass" if data.broken => Err(self.dnu(method, selector)),
            "inClass" => Ok(data.class),
            "selector" => {
                let name = data.selector.clone();
                Ok(self.symbol(&name))
            }
            "sourceString" => {
                let source = data.source.clone();
                Ok(self.new_bytes("String", &source))
            }
            "_sourceOffsets" => {
                let offsets = data
                    .step_offsets
                    .iter()
                    .map(|&o| Oop::from_i64(o as i64 + 1).unwrap_or(Oop::NIL))
                    .collect();
                Ok(self.new_array(offsets))
            }
            "_stepPointForIp:level:useNext:" => Ok(args[0]),
            "clearAllBreaks" | "setBreakAtStepPoint:" if data.locked => Err(vm_error(
                ERR_BAD_ARGUMENT,
                "breakpoints of this method cannot change",
            )),
            "clearAllBreaks" => {
                data.breaks.clear();
                Ok(method)
            }
            "setBreakAtStepPoint:" => {
                let step = int_arg(args, 0)?;
                let data = self.method_data(method)?;
                if step < 1 || step as usize > data.step_offsets.len() {
                    return Err(vm_error(ERR_BAD_ARGUMENT, format!("no step point {step}")));
                }
                data.breaks.push(step);
                Ok(method)
            }
            _ => Err(self.dnu(method, selector)),
        }
    }

    fn process_data(&mut self, process: Oop) -> Result<&mut ProcessData, GciError> {
        match &mut self.obj_mut(process)?.body {
            Body::Process(data) => Ok(data),
            _ => Err(vm_error(ERR_BAD_ARGUMENT, "expected a process")),
        }
    }

    fn perform_process(
        &mut self,
        process: Oop,
        selector: &str,
        args: &[Oop],
    ) -> Result<Oop, GciError> {
        match selector {
            "stackDepth" => {
                let depth = self.process_data(process)?.frames.len();
                Ok(Oop::from_i32(depth as i32))
            }
            "_frameContentsAt:" => {
                let level = int_arg(args, 0)?;
                if level < 1 {
                    return Ok(Oop::NIL);
                }
                if self.process_data(process)?.unreadable.contains(&level) {
                    return Err(vm_error(ERR_BAD_ARGUMENT, "frame contents are not accessible"));
                }
                let frames = &self.process_data(process)?.frames;
                let Some(frame) = frames.get(level as usize - 1).cloned() else {
                    return Ok(Oop::NIL);
                };
                let names = if frame.names.is_empty() {
                    Oop::NIL
                } else {
                    let symbols = frame.names.iter().map(|n| self.symbol(n)).collect();
                    self.new_array(symbols)
                };
                let step_point = Oop::from_i64(frame.step_point).unwrap_or(Oop::NIL);
                let mut slots = vec![frame.method, step_point];
                slots.extend([Oop::NIL; 6]);
                slots.push(names);
                slots.push(frame.receiver);
                slots.extend(frame.values);
                Ok(self.new_array(slots))
            }
            "gciStepOverFromLevel:" | "gciStepIntoFromLevel:" | "gciStepThruFromLevel:" => {
                let level = int_arg(args, 0)?;
                self.process_data(process)?.armed = Some((selector.to_string(), level));
                Ok(process)
            }
            "_trimStackToLevel:" => {
                let level = int_arg(args, 0)?;
                let data = self.process_data(process)?;
                if level < 1 || level as usize > data.frames.len() {
                    return Err(vm_error(ERR_BAD_ARGUMENT, format!("no stack level {level}")));
                }
                data.frames.drain(0..level as usize - 1);
                Ok(process)
            }
            _ => Err(self.dnu(process, selector)),
        }
    }

    fn resume(&mut self, process: Oop) -> Result<Oop, GciError> {
        let data = self.process_data(process)?;
        data.armed = None;
        match data.resume.pop_front() {
            None => {
                data.frames.clear();
                Ok(Oop::NIL)
            }
            Some(Resume::Complete(value)) => {
                data.frames.clear();
                Ok(value)
            }
            Some(Resume::Stop {
                number,
                message,
                frames,
            }) => {
                if let Some(frames) = frames {
                    data.frames = frames;
                }
                Err(GciError::from(ErrorRecord::new(number, message).with_context(process)))
            }
        }
    }

    fn compile(&mut self, req: &CompileRequest) -> Result<Oop, GciError> {
        let source = self.string_of(req.source)?;
        let compile_error = || vm_error(ERR_COMPILE, "expected a selector and `^ <integer>`");
        let (pattern, body) = source.split_once('\n').ok_or_else(compile_error)?;
        let selector = pattern.trim();
        if selector.is_empty() || selector.contains(char::is_whitespace) {
            return Err(compile_error());
        }
        let ret = source.find('^').ok_or_else(compile_error)?;
        let result = body
            .trim()
            .strip_prefix('^')
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(Oop::from_i64)
            .ok_or_else(compile_error)?;

        let method_class = self.global("GsNMethod");
        let method = self.alloc(Obj {
            class: method_class,
            body: Body::Method(MethodData {
                class: req.class,
                selector: selector.to_string(),
                source: source.clone(),
                step_offsets: vec![ret],
                breaks: vec![],
                result,
                broken: false,
                locked: false,
            }),
            ..Default::default()
        });
        match &mut self.obj_mut(req.class)?.body {
            Body::Class(data) => {
                data.methods.insert((selector.to_string(), req.env), method);
                Ok(method)
            }
            _ => Err(vm_error(ERR_BAD_ARGUMENT, "compile target is not a class")),
        }
    }

    fn report(&self, oop: Oop) -> Result<ObjectReport, GciError> {
        let obj = self.obj(oop)?;
        let (implementation, idx_size, body) = match &obj.bytes {
            Some(bytes) => (ObjImpl::Byte, bytes.len(), Bytes::from(bytes.clone())),
            None => {
                let mut body = BytesMut::new();
                for slot in obj.named.iter().chain(obj.indexed.iter()) {
                    body.put_u64_le(slot.raw());
                }
                (ObjImpl::Pointer, obj.indexed.len(), body.freeze())
            }
        };
        Ok(ObjectReport {
            obj_id: oop,
            oclass: obj.class,
            first_offset: 1,
            named_size: obj.named.len() as i16,
            object_security_policy_id: 0,
            idx_size_bits: IdxSizeBits::new(idx_size as u64, implementation, idx_size > 0, false),
            body,
        })
    }

    /// Move as many pending traversal reports into `buf` as fit.
    fn fill_traversal(&mut self, buf: &mut TraversalBuffer) -> Result<TraversalStatus, GciError> {
        let capacity = buf.allocated();
        let mut take = 0;
        while take < self.trav_more.len()
            && gemstalker::gci::traversal::packed_size(&self.trav_more[..=take]) <= capacity
        {
            take += 1;
        }
        let reports: Vec<ObjectReport> = self.trav_more.drain(..take).collect();
        *buf = TraversalBuffer::from_reports(&reports, capacity)?;
        Ok(if self.trav_more.is_empty() {
            TraversalStatus::Complete
        } else {
            TraversalStatus::More
        })
    }
}

/// In-memory implementation of [`Gci`].
pub struct FakeGem {
    state: Mutex<State>,
}

impl Default for FakeGem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGem {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `f` on the state of a logged in session, recording `call`.
    fn with<R>(
        &self,
        session: SessionHandle,
        call: impl Into<String>,
        f: impl FnOnce(&mut State) -> Result<R, GciError>,
    ) -> Result<R, GciError> {
        let mut state = self.state();
        if !state.sessions.contains(&session.0) {
            return Err(GciError::NotLoggedIn);
        }
        state.calls.push(call.into());
        f(&mut *state)
    }

    // --------------------------------- fixtures --------------------------------------------------

    pub fn define_class(&self, name: &str, inst_vars: &[&str]) -> Oop {
        self.state().define_class(name, inst_vars, false)
    }

    /// Method of `class` (nil for an executed code block) answering `result`.
    pub fn define_method(
        &self,
        class: Oop,
        selector: &str,
        source: &str,
        step_offsets: &[usize],
        result: Oop,
    ) -> Oop {
        let mut state = self.state();
        let method_class = state.global("GsNMethod");
        let method = state.alloc(Obj {
            class: method_class,
            body: Body::Method(MethodData {
                class,
                selector: selector.to_string(),
                source: source.to_string(),
                step_offsets: step_offsets.to_vec(),
                breaks: vec![],
                result,
                broken: false,
                locked: false,
            }),
            ..Default::default()
        });
        if let Some(Obj {
            body: Body::Class(data),
            ..
        }) = state.objects.get_mut(&class)
        {
            data.methods.insert((selector.to_string(), 0), method);
        }
        method
    }

    /// Make `inClass` of `method` fail.
    pub fn break_method(&self, method: Oop) {
        if let Ok(data) = self.state().method_data(method) {
            data.broken = true;
        }
    }

    /// Make `_frameContentsAt: level` of `process` fail.
    pub fn hide_frame(&self, process: Oop, level: i64) {
        if let Ok(data) = self.state().process_data(process) {
            data.unreadable.insert(level);
        }
    }

    pub fn lock_breaks(&self, method: Oop) {
        if let Ok(data) = self.state().method_data(method) {
            data.locked = true;
        }
    }

    pub fn new_object(
        &self,
        class: Oop,
        named: &[Oop],
        indexed: &[Oop],
        print: Option<&str>,
    ) -> Oop {
        self.state().alloc(Obj {
            class,
            named: named.to_vec(),
            indexed: indexed.to_vec(),
            print: print.map(str::to_string),
            ..Default::default()
        })
    }

    pub fn new_string(&self, s: &str) -> Oop {
        self.state().new_bytes("String", s)
    }

    pub fn new_process(&self, frames: Vec<FakeFrame>) -> Oop {
        let mut state = self.state();
        let class = state.global("GsProcess");
        state.alloc(Obj {
            class,
            body: Body::Process(ProcessData {
                frames,
                resume: VecDeque::new(),
                armed: None,
                unreadable: HashSet::new(),
            }),
            ..Default::default()
        })
    }

    pub fn push_resume(&self, process: Oop, resume: Resume) {
        if let Ok(data) = self.state().process_data(process) {
            data.resume.push_back(resume);
        }
    }

    pub fn stack_depth(&self, process: Oop) -> usize {
        self.state()
            .process_data(process)
            .map(|d| d.frames.len())
            .unwrap_or(0)
    }

    pub fn armed_step(&self, process: Oop) -> Option<(String, i64)> {
        self.state()
            .process_data(process)
            .ok()
            .and_then(|d| d.armed.clone())
    }

    pub fn method_breaks(&self, method: Oop) -> Vec<i64> {
        self.state()
            .method_data(method)
            .map(|d| d.breaks.clone())
            .unwrap_or_default()
    }

    pub fn script(&self, source: &str, reply: Reply) {
        self.state().scripts.insert(source.to_string(), reply);
    }

    /// Non-blocking calls need `polls` polls before their result is ready.
    pub fn set_nb_delay(&self, polls: u32) {
        self.state().nb_delay = polls;
    }

    pub fn ignore_soft_break(&self) {
        self.state().ignore_soft_break = true;
    }

    /// A hard break leaves the running call unfinished until [`FakeGem::finish_pending`].
    pub fn hard_break_hangs(&self) {
        self.state().hard_break_hangs = true;
    }

    pub fn finish_pending(&self) {
        if let Some(pending) = self.state().pending.as_mut() {
            pending.polls_left = 0;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn cleared_stacks(&self) -> Vec<Oop> {
        self.state().cleared.clone()
    }
}

impl Gci for FakeGem {
    fn version(&self) -> String {
        FAKE_VERSION.to_string()
    }

    fn login(&self, params: &LoginParams) -> Result<SessionHandle, GciError> {
        if params.username.is_empty() {
            return Err(vm_error(ERR_LOGIN, "login failed: no user name"));
        }
        let mut state = self.state();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id);
        state.calls.push(format!("login {}", params.username));
        Ok(SessionHandle(id))
    }

    fn logout(&self, session: SessionHandle) -> Result<(), GciError> {
        self.with(session, "logout", |s| {
            s.sessions.remove(&session.0);
            Ok(())
        })
    }

    fn abort(&self, session: SessionHandle) -> Result<(), GciError> {
        self.with(session, "abort", |_| Ok(()))
    }

    fn begin(&self, session: SessionHandle) -> Result<(), GciError> {
        self.with(session, "begin", |_| Ok(()))
    }

    fn commit(&self, session: SessionHandle) -> Result<bool, GciError> {
        self.with(session, "commit", |_| Ok(true))
    }

    fn resolve_symbol(
        &self,
        session: SessionHandle,
        name: &str,
        _symbol_list: Oop,
    ) -> Result<Oop, GciError> {
        self.with(session, format!("resolve {name}"), |s| {
            let oop = s.global(name);
            if oop.is_nil() {
                return Err(vm_error(ERR_NOT_FOUND, format!("undefined symbol {name}")));
            }
            Ok(oop)
        })
    }

    fn execute(&self, session: SessionHandle, req: &ExecRequest) -> Result<Oop, GciError> {
        self.with(session, format!("execute {}", req.source), |s| {
            s.evaluate(req.source, req.context)
        })
    }

    fn execute_fetch_bytes(
        &self,
        session: SessionHandle,
        req: &ExecRequest,
        max: usize,
    ) -> Result<Vec<u8>, GciError> {
        self.with(session, format!("execute {}", req.source), |s| {
            let result = s.evaluate(req.source, req.context)?;
            let mut bytes = s.bytes_or_print(result);
            bytes.truncate(max);
            Ok(bytes)
        })
    }

    fn perform(&self, session: SessionHandle, req: &PerformRequest) -> Result<Oop, GciError> {
        self.with(session, format!("perform {}", req.selector), |s| {
            s.perform(req.receiver, req.selector, req.args)
        })
    }

    fn perform_fetch_bytes(
        &self,
        session: SessionHandle,
        req: &PerformRequest,
        max: usize,
    ) -> Result<Vec<u8>, GciError> {
        self.with(session, format!("perform {}", req.selector), |s| {
            let result = s.perform(req.receiver, req.selector, req.args)?;
            let mut bytes = s.bytes_or_print(result);
            bytes.truncate(max);
            Ok(bytes)
        })
    }

    fn compile_method(
        &self,
        session: SessionHandle,
        req: &CompileRequest,
    ) -> Result<Oop, GciError> {
        self.with(session, "compile", |s| s.compile(req))
    }

    fn nb_execute(&self, session: SessionHandle, req: &ExecRequest) -> Result<(), GciError> {
        self.with(session, format!("nb_execute {}", req.source), |s| {
            let reply = s.evaluate(req.source, req.context);
            s.pending = Some(Pending {
                reply,
                polls_left: s.nb_delay,
            });
            Ok(())
        })
    }

    fn nb_perform(&self, session: SessionHandle, req: &PerformRequest) -> Result<(), GciError> {
        self.with(session, format!("nb_perform {}", req.selector), |s| {
            let reply = s.perform(req.receiver, req.selector, req.args);
            s.pending = Some(Pending {
                reply,
                polls_left: s.nb_delay,
            });
            Ok(())
        })
    }

    fn nb_poll(&self, session: SessionHandle, _timeout_ms: i32) -> Result<PollStatus, GciError> {
        let mut state = self.state();
        if !state.sessions.contains(&session.0) {
            return Err(GciError::NotLoggedIn);
        }
        let Some(pending) = state.pending.as_mut() else {
            return Err(GciError::InvalidArgument("no call outstanding".to_string()));
        };
        match pending.polls_left {
            0 => Ok(PollStatus::Ready),
            HANG => Ok(PollStatus::NotReady),
            _ => {
                pending.polls_left -= 1;
                Ok(PollStatus::NotReady)
            }
        }
    }

    fn nb_result(&self, session: SessionHandle) -> Result<Oop, GciError> {
        self.with(session, "nb_result", |s| match s.pending.take() {
            Some(pending) => pending.reply,
            None => Err(GciError::InvalidArgument("no call outstanding".to_string())),
        })
    }

    fn interrupt(&self, session: SessionHandle, hard: bool) -> Result<(), GciError> {
        let call = if hard { "interrupt hard" } else { "interrupt soft" };
        self.with(session, call, |s| {
            let ignore_soft = s.ignore_soft_break;
            let hangs = s.hard_break_hangs;
            let process = if hard || ignore_soft {
                Oop::NIL
            } else {
                let class = s.global("GsProcess");
                s.alloc(Obj {
                    class,
                    body: Body::Process(ProcessData {
                        frames: vec![],
                        resume: VecDeque::new(),
                        armed: None,
                        unreadable: HashSet::new(),
                    }),
                    ..Default::default()
                })
            };
            let Some(pending) = s.pending.as_mut() else {
                return Ok(());
            };
            match (hard, ignore_soft, hangs) {
                (false, true, _) => {}
                (false, false, _) => {
                    let record =
                        ErrorRecord::new(ERR_SOFT_BREAK, "soft break").with_context(process);
                    pending.reply = Err(GciError::from(record));
                    pending.polls_left = 0;
                }
                (true, _, true) => pending.polls_left = HANG,
                (true, _, false) => {
                    pending.reply = Err(vm_error(ERR_HARD_BREAK, "hard break"));
                    pending.polls_left = 0;
                }
            }
            Ok(())
        })
    }

    fn clear_stack(&self, session: SessionHandle, process: Oop) -> Result<(), GciError> {
        self.with(session, "clear_stack", |s| {
            s.cleared.push(process);
            if let Ok(data) = s.process_data(process) {
                data.frames.clear();
            }
            Ok(())
        })
    }

    fn continue_with(
        &self,
        session: SessionHandle,
        process: Oop,
        _replace_top: Oop,
        _flags: i32,
    ) -> Result<Oop, GciError> {
        self.with(session, "continue", |s| s.resume(process))
    }

    fn fetch_class(&self, session: SessionHandle, oop: Oop) -> Result<Oop, GciError> {
        self.with(session, "fetch_class", |s| s.class_of(oop))
    }

    fn fetch_size(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError> {
        self.with(session, "fetch_size", |s| {
            let obj = s.obj(oop)?;
            Ok(match &obj.bytes {
                Some(bytes) => bytes.len(),
                None => obj.named.len() + obj.indexed.len(),
            } as i64)
        })
    }

    fn fetch_varying_size(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError> {
        self.with(session, "fetch_varying_size", |s| {
            let obj = s.obj(oop)?;
            Ok(match &obj.bytes {
                Some(bytes) => bytes.len(),
                None => obj.indexed.len(),
            } as i64)
        })
    }

    fn fetch_obj_info(&self, session: SessionHandle, oop: Oop) -> Result<ObjInfo, GciError> {
        self.with(session, "fetch_obj_info", |s| {
            let obj = s.obj(oop)?;
            let (size, implementation, indexable) = match &obj.bytes {
                Some(bytes) => (bytes.len(), 1, true),
                None => (obj.named.len() + obj.indexed.len(), 0, !obj.indexed.is_empty()),
            };
            Ok(ObjInfo {
                id: oop,
                class: obj.class,
                size: size as i64,
                named_size: obj.named.len() as i32,
                access: 0,
                security_policy: 0,
                bits: implementation | if indexable { 0x04 } else { 0 },
            })
        })
    }

    fn fetch_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        max: usize,
    ) -> Result<Vec<u8>, GciError> {
        self.with(session, "fetch_bytes", |s| {
            let bytes = s.obj(oop)?.bytes.clone().unwrap_or_default();
            Ok(bytes.into_iter().skip((start - 1).max(0) as usize).take(max).collect())
        })
    }

    fn fetch_utf8_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        max: usize,
    ) -> Result<Utf8Fetch, GciError> {
        self.with(session, "fetch_utf8_bytes", |s| {
            let bytes = s.string_of(oop)?.into_bytes();
            let rest: Vec<u8> = bytes.into_iter().skip((start - 1).max(0) as usize).collect();
            let required = rest.len();
            Ok(Utf8Fetch {
                bytes: rest.into_iter().take(max).collect(),
                required,
            })
        })
    }

    fn store_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        bytes: &[u8],
        _of_class: Oop,
    ) -> Result<(), GciError> {
        self.with(session, "store_bytes", |s| {
            let obj = s.obj_mut(oop)?;
            let stored = obj.bytes.get_or_insert_with(Vec::new);
            stored.truncate((start - 1).max(0) as usize);
            stored.extend_from_slice(bytes);
            Ok(())
        })
    }

    fn fetch_oops(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        count: usize,
    ) -> Result<Vec<Oop>, GciError> {
        self.with(session, "fetch_oops", |s| {
            let obj = s.obj(oop)?;
            Ok(obj
                .named
                .iter()
                .chain(obj.indexed.iter())
                .skip((start - 1).max(0) as usize)
                .take(count)
                .copied()
                .collect())
        })
    }

    fn store_oops(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        oops: &[Oop],
        _overlay: bool,
    ) -> Result<(), GciError> {
        self.with(session, "store_oops", |s| {
            let obj = s.obj_mut(oop)?;
            let named = obj.named.len();
            for (i, &value) in oops.iter().enumerate() {
                let idx = (start - 1).max(0) as usize + i;
                if idx < named {
                    obj.named[idx] = value;
                } else if idx - named < obj.indexed.len() {
                    obj.indexed[idx - named] = value;
                } else {
                    obj.indexed.push(value);
                }
            }
            Ok(())
        })
    }

    fn new_obj(&self, session: SessionHandle, class: Oop) -> Result<Oop, GciError> {
        self.with(session, "new_obj", |s| s.perform_class(class, "new", &[]))
    }

    fn new_string(&self, session: SessionHandle, string: &str) -> Result<Oop, GciError> {
        self.with(session, "new_string", |s| Ok(s.new_bytes("String", string)))
    }

    fn new_symbol(&self, session: SessionHandle, string: &str) -> Result<Oop, GciError> {
        self.with(session, "new_symbol", |s| Ok(s.symbol(string)))
    }

    fn i64_to_oop(&self, session: SessionHandle, i: i64) -> Result<Oop, GciError> {
        self.with(session, "i64_to_oop", |_| {
            Oop::from_i64(i).ok_or_else(|| vm_error(ERR_BAD_ARGUMENT, "LargeInteger"))
        })
    }

    fn oop_to_i64(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError> {
        self.with(session, "oop_to_i64", |_| {
            oop.as_i64()
                .ok_or_else(|| vm_error(ERR_BAD_ARGUMENT, "not an integer"))
        })
    }

    fn double_to_oop(&self, session: SessionHandle, d: f64) -> Result<Oop, GciError> {
        self.with(session, "double_to_oop", |_| {
            Oop::small_double(d).ok_or_else(|| vm_error(ERR_BAD_ARGUMENT, "Float"))
        })
    }

    fn oop_to_double(&self, session: SessionHandle, oop: Oop) -> Result<f64, GciError> {
        self.with(session, "oop_to_double", |_| {
            oop.as_f64()
                .ok_or_else(|| vm_error(ERR_BAD_ARGUMENT, "not a float"))
        })
    }

    fn fetch_traversal(
        &self,
        session: SessionHandle,
        oops: &[Oop],
        _args: &ClampedTravArgs,
        buf: &mut TraversalBuffer,
    ) -> Result<TraversalStatus, GciError> {
        self.with(session, "fetch_traversal", |s| {
            s.trav_more = oops
                .iter()
                .map(|&oop| s.report(oop))
                .collect::<Result<_, _>>()?;
            s.fill_traversal(buf)
        })
    }

    fn more_traversal(
        &self,
        session: SessionHandle,
        buf: &mut TraversalBuffer,
    ) -> Result<TraversalStatus, GciError> {
        self.with(session, "more_traversal", |s| s.fill_traversal(buf))
    }

    fn store_traversal(
        &self,
        session: SessionHandle,
        buf: &mut TraversalBuffer,
        _flags: i32,
    ) -> Result<(), GciError> {
        self.with(session, "store_traversal", |s| {
            for report in buf.reports()? {
                let obj = s.obj_mut(report.obj_id)?;
                match &mut obj.bytes {
                    Some(bytes) => *bytes = report.body.to_vec(),
                    None => {
                        let oops = report.body_oops();
                        let named = (report.named_size.max(0) as usize).min(oops.len());
                        obj.named = oops[..named].to_vec();
                        obj.indexed = oops[named..].to_vec();
                    }
                }
            }
            Ok(())
        })
    }
}

// --------------------------------- sessions ------------------------------------------------------

pub fn login_params() -> LoginParams {
    LoginParams {
        stone: "gs64stone".to_string(),
        gem: "!tcp@localhost#netldi:gs64ldi#task!gemnetobject".to_string(),
        username: "DataCurator".to_string(),
        password: "swordfish".to_string(),
        ..Default::default()
    }
}

/// Fast polling so that tests do not wait.
pub fn fast_poll() -> PollConfig {
    PollConfig {
        backoff_ms: vec![1],
        progress_after_ms: 0,
        drain_timeout_ms: 20,
    }
}

pub fn login(gem: &Arc<FakeGem>) -> (Arc<SessionRegistry>, Arc<GemSession>) {
    let registry = Arc::new(SessionRegistry::new(gem.clone()));
    let session = registry.login(&login_params()).unwrap();
    (registry, session)
}

// --------------------------------- suspended process ---------------------------------------------

pub const POINT_SOURCE: &str = "x: ax y: ay\n  x := ax.\n  y := ay.\n  ^ self";
pub const POINT_STEPS: &[usize] = &[14, 25, 36];
pub const RUN_SOURCE: &str = "run\n  | list |\n  list := self makeList.\n  ^ list size";
pub const RUN_STEPS: &[usize] = &[30, 49, 42];
pub const RUN_PATH: &str = "/Globals/Calculator/instance/running/run";
pub const DOIT_SOURCE: &str = "Calculator new run";

/// A process suspended three levels deep:
///
/// ```text
/// 1: Point>>x:y:     stopped at step 2, line 3
/// 2: Calculator>>run stopped at step 1, line 3
/// 3: Executed Code
/// ```
pub struct Fixture {
    pub gem: Arc<FakeGem>,
    pub registry: Arc<SessionRegistry>,
    pub session: Arc<GemSession>,
    pub process: Oop,
    pub point: Oop,
    pub list: Oop,
    pub point_method: Oop,
    pub run_method: Oop,
    pub doit_method: Oop,
}

impl Fixture {
    pub fn new() -> Self {
        let gem = Arc::new(FakeGem::new());
        let point_class = gem.define_class("Point", &["x", "y"]);
        let calc_class = gem.define_class("Calculator", &[]);
        let array_class = gem.state().global("Array");

        let point = gem.new_object(
            point_class,
            &[Oop::from_i32(3), Oop::from_i32(4)],
            &[],
            Some("3@4"),
        );
        let calc = gem.new_object(calc_class, &[], &[], None);
        let list = gem.new_object(
            array_class,
            &[],
            &[Oop::from_i32(10), Oop::from_i32(20), Oop::from_i32(30)],
            Some("anArray(10 20 30)"),
        );

        let point_method = gem.define_method(point_class, "x:y:", POINT_SOURCE, POINT_STEPS, point);
        let run_method =
            gem.define_method(calc_class, "run", RUN_SOURCE, RUN_STEPS, Oop::from_i32(3));
        let doit_method = gem.define_method(Oop::NIL, "", DOIT_SOURCE, &[0], Oop::NIL);

        let frames = Self::frames(point, calc, list, point_method, run_method, doit_method);
        let process = gem.new_process(frames);
        let (registry, session) = login(&gem);
        Self {
            gem,
            registry,
            session,
            process,
            point,
            list,
            point_method,
            run_method,
            doit_method,
        }
    }

    fn frames(
        point: Oop,
        calc: Oop,
        list: Oop,
        point_method: Oop,
        run_method: Oop,
        doit_method: Oop,
    ) -> Vec<FakeFrame> {
        vec![
            FakeFrame {
                method: point_method,
                step_point: 2,
                receiver: point,
                names: vec!["ax", "ay"],
                values: vec![Oop::from_i32(3), Oop::from_i32(4)],
            },
            FakeFrame {
                method: run_method,
                step_point: 1,
                receiver: calc,
                names: vec!["list"],
                values: vec![list],
            },
            FakeFrame {
                method: doit_method,
                step_point: 1,
                receiver: Oop::NIL,
                names: vec![],
                values: vec![],
            },
        ]
    }

    /// Top frame after a step to the return of `Point>>x:y:`.
    pub fn stepped_frames(&self) -> Vec<FakeFrame> {
        let mut frames = self.gem.state().process_data(self.process).unwrap().frames.clone();
        frames[0].step_point = 3;
        frames
    }
}

// --------------------------------- hooks ---------------------------------------------------------

#[derive(Clone, Default)]
pub struct TestInfo {
    pub stops: Arc<RefCell<Vec<(StopReason, String)>>>,
    pub terminated: Arc<Cell<u32>>,
}

impl TestInfo {
    pub fn last_stop(&self) -> Option<(StopReason, String)> {
        self.stops.borrow().last().cloned()
    }
}

#[derive(Default)]
pub struct TestHooks {
    info: TestInfo,
}

impl TestHooks {
    pub fn new(info: TestInfo) -> Self {
        Self { info }
    }
}

impl EventHook for TestHooks {
    fn on_stopped(&self, reason: StopReason, description: &str) -> anyhow::Result<()> {
        self.info
            .stops
            .borrow_mut()
            .push((reason, description.to_string()));
        Ok(())
    }

    fn on_terminated(&self) {
        self.info.terminated.set(self.info.terminated.get() + 1);
    }
}

/// Records progress callbacks.
#[derive(Default)]
pub struct TestProgress {
    pub events: RefCell<Vec<String>>,
}

impl ProgressSink for TestProgress {
    fn start(&self, title: &str) {
        self.events.borrow_mut().push(format!("start {title}"));
    }

    fn update(&self, _elapsed: Duration) {
        let mut events = self.events.borrow_mut();
        if events.last().map(String::as_str) != Some("update") {
            events.push("update".to_string());
        }
    }

    fn end(&self) {
        self.events.borrow_mut().push("end".to_string());
    }
}

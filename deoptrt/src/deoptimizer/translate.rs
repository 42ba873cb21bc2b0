//! Building output frames from a translation.
//!
//! Each builder fills its frame from the highest address down: incoming parameters first, then
//! the fixed part of the frame, then the rest of the frame's height. Frame 0 takes the optimised
//! frame's place on the stack; every later frame sits directly below the one before it and links
//! back to it as its caller.

use super::{
    BailoutType, DeferredArguments, DeferredDuplicate, DeferredNumber, Deoptimizer, FrameLayout,
    ValueSlot,
};
use crate::{
    errors::{fatal, fatal_logged},
    frame_description::FrameDescription,
    frames::{self, FrameType, Register, accessor, adaptor, construct, standard},
    isolate::{Builtin, Isolate},
    objects::FunctionIdx,
    slot_ref::SlotRef,
    tagged::{Address, Tagged, WORD_SIZE},
};
use deoptmap::{BailoutId, Opcode, SELF_LITERAL_ID, TranslationIterator};

impl Deoptimizer {
    pub(super) fn do_compute_output_frames(&mut self, isolate: &Isolate, translation_index: usize) {
        let data = self.data.clone();
        let mut it = TranslationIterator::new(data.translations(), translation_index);
        let opcode = it.next_opcode();
        if opcode != Opcode::Begin {
            fatal_logged!(
                isolate.log,
                "translation {translation_index} starts with {opcode}, not BEGIN"
            );
        }
        let count = it.next_usize();
        let jsframe_count = it.next_usize();
        if count == 0 {
            fatal_logged!(isolate.log, "translation {translation_index} has no frames");
        }
        self.output = (0..count).map(|_| None).collect();
        self.layouts = Vec::with_capacity(count);

        for i in 0..count {
            match it.next_opcode() {
                Opcode::JsFrame => {
                    self.do_compute_js_frame(isolate, &mut it, i);
                    self.jsframe_count += 1;
                }
                Opcode::ArgumentsAdaptorFrame => {
                    self.do_compute_arguments_adaptor_frame(isolate, &mut it, i)
                }
                Opcode::ConstructStubFrame => self.do_compute_construct_stub_frame(isolate, &mut it, i),
                Opcode::GetterStubFrame => self.do_compute_accessor_stub_frame(isolate, &mut it, i, false),
                Opcode::SetterStubFrame => self.do_compute_accessor_stub_frame(isolate, &mut it, i, true),
                x => fatal_logged!(
                    isolate.log,
                    "frame {i} of translation {translation_index} starts with {x}"
                ),
            }
        }

        // Every value command has been consumed: the next translation, if any, starts here.
        if it.has_next() {
            let opcode = it.next_opcode();
            if opcode != Opcode::Begin {
                fatal_logged!(
                    isolate.log,
                    "translation {translation_index} has {opcode} after its last frame"
                );
            }
        }
        if self.jsframe_count != jsframe_count {
            fatal_logged!(
                isolate.log,
                "translation {translation_index} declares {jsframe_count} JavaScript frames but has {}",
                self.jsframe_count
            );
        }
    }

    /// Resolve the function a frame command names.
    fn resolve_function(&self, isolate: &Isolate, literal_id: i64) -> (FunctionIdx, Tagged) {
        if literal_id == SELF_LITERAL_ID {
            return (self.function, self.function_tagged);
        }
        let Some(lit) = usize::try_from(literal_id)
            .ok()
            .and_then(|i| self.data.literal(i))
            .copied()
        else {
            fatal_logged!(
                isolate.log,
                "literal {literal_id} outside pool of {}",
                self.data.literals().len()
            )
        };
        match isolate.function_from_tagged(lit) {
            Some(f) => (f, lit),
            None => fatal_logged!(isolate.log, "literal {literal_id} ({lit}) is not a function"),
        }
    }

    fn previous_frame(&self, frame_index: usize) -> &FrameDescription {
        match frame_index.checked_sub(1) {
            Some(i) => self.output_frame(i),
            None => fatal!("frame 0 has no caller frame in the output"),
        }
    }

    fn check_inner_frame(&self, isolate: &Isolate, frame_index: usize, what: FrameType) {
        if frame_index == 0 || frame_index + 1 == self.output.len() {
            fatal_logged!(
                isolate.log,
                "{what} frame at index {frame_index} of {} is outermost or innermost",
                self.output.len()
            );
        }
    }

    fn install_frame(&mut self, frame_index: usize, frame: FrameDescription, layout: FrameLayout) {
        if self.output[frame_index].is_some() {
            fatal!("output frame {frame_index} built twice");
        }
        self.output[frame_index] = Some(Box::new(frame));
        debug_assert_eq!(self.layouts.len(), frame_index);
        self.layouts.push(layout);
    }

    fn do_compute_js_frame(&mut self, isolate: &Isolate, it: &mut TranslationIterator, frame_index: usize) {
        let node_id = BailoutId::new(it.next());
        let literal_id = it.next();
        let is_bottommost = frame_index == 0;
        let is_topmost = frame_index + 1 == self.output.len();
        if is_bottommost && literal_id != SELF_LITERAL_ID {
            fatal_logged!(
                isolate.log,
                "outermost frame names literal {literal_id} rather than the function itself"
            );
        }
        let (function, function_tagged) = self.resolve_function(isolate, literal_id);
        let height = it.next_usize();
        let height_in_bytes = height * WORD_SIZE;
        let shared = isolate.shared_of(function);
        let parameter_count = shared.formal_parameter_count() as usize + 1;
        let fixed_frame_size = frames::compute_fixed_size(parameter_count);
        let output_frame_size = height_in_bytes + fixed_frame_size;

        let top_address = if is_bottommost {
            // The context and function sit between the frame pointer and the frame's height.
            self.input.register(Register::FP) - (2 * WORD_SIZE + height_in_bytes) as u64
        } else {
            self.previous_frame(frame_index).top() - output_frame_size as u64
        };
        let mut frame = FrameDescription::new(output_frame_size, Some(function));
        frame.set_frame_type(FrameType::JavaScript);
        frame.set_top(top_address);
        self.install_frame(
            frame_index,
            frame,
            FrameLayout {
                frame_type: FrameType::JavaScript,
                top: top_address,
                frame_size: output_frame_size,
                parameter_count,
                function: Some(function_tagged),
            },
        );

        // The offset of the optimised frame's function slot, if this frame replaces it.
        let input_base = if is_bottommost {
            match self.input.frame_size().checked_sub(fixed_frame_size) {
                Some(x) => Some(x),
                None => fatal_logged!(
                    isolate.log,
                    "optimised frame of {} bytes cannot hold {parameter_count} parameters",
                    self.input.frame_size()
                ),
            }
        } else {
            None
        };

        let mut output_offset = output_frame_size;
        for _ in 0..parameter_count {
            output_offset -= WORD_SIZE;
            self.translate_command(it, frame_index, output_offset);
        }

        // Caller's pc.
        output_offset -= WORD_SIZE;
        let caller_pc = match input_base {
            Some(b) => self.input.frame_slot(b + 3 * WORD_SIZE),
            None => self.previous_frame(frame_index).pc(),
        };
        self.output_frame_mut(frame_index)
            .set_frame_slot(output_offset, caller_pc);

        // Caller's fp.
        output_offset -= WORD_SIZE;
        let caller_fp = match input_base {
            Some(b) => self.input.frame_slot(b + 2 * WORD_SIZE),
            None => self.previous_frame(frame_index).fp(),
        };
        let fp_value = top_address + output_offset as u64;
        if is_bottommost && fp_value != self.input.register(Register::FP) {
            fatal_logged!(
                isolate.log,
                "outermost frame's fp {fp_value:#x} differs from the optimised frame's {:#x}",
                self.input.register(Register::FP)
            );
        }
        let frame = self.output_frame_mut(frame_index);
        frame.set_frame_slot(output_offset, caller_fp);
        frame.set_fp(fp_value);
        if is_topmost {
            frame.set_register(Register::FP, fp_value);
        }

        // Context.
        output_offset -= WORD_SIZE;
        let context = match input_base {
            Some(b) => self.input.tagged_frame_slot(b + WORD_SIZE),
            None => isolate.function(function).context(),
        };
        let frame = self.output_frame_mut(frame_index);
        frame.set_tagged_frame_slot(output_offset, context);
        frame.set_context(context);
        if is_topmost {
            frame.set_register(Register::CONTEXT, context.raw());
        }

        // Function.
        output_offset -= WORD_SIZE;
        if let Some(b) = input_base {
            let found = self.input.tagged_frame_slot(b);
            if found != function_tagged {
                fatal_logged!(
                    isolate.log,
                    "optimised frame holds {found} where {function_tagged} was expected"
                );
            }
        }
        let frame = self.output_frame_mut(frame_index);
        frame.set_tagged_frame_slot(output_offset, function_tagged);
        debug_assert_eq!(frame.slot_offset_from_fp(standard::MARKER_OFFSET), output_offset);
        debug_assert_eq!(
            frame.tagged_frame_slot(frame.slot_offset_from_fp(standard::CONTEXT_OFFSET)),
            context
        );

        for _ in 0..height {
            output_offset -= WORD_SIZE;
            self.translate_command(it, frame_index, output_offset);
        }
        debug_assert_eq!(output_offset, 0);

        let unoptimized = isolate.code(shared.code());
        let Some(pc_and_state) = unoptimized
            .deopt_output()
            .and_then(|d| d.pc_and_state(node_id))
        else {
            fatal_logged!(
                isolate.log,
                "unoptimised code of {} has no entry for ast id {node_id}",
                shared.name()
            )
        };
        let continuation = match (is_topmost, self.bailout_type) {
            (true, BailoutType::Eager) => Some(Builtin::NotifyDeoptimized),
            (true, BailoutType::Lazy) => Some(Builtin::NotifyLazyDeoptimized),
            _ => None,
        };
        let frame = self.output_frame_mut(frame_index);
        frame.set_pc(unoptimized.start() + u64::from(pc_and_state.pc_offset()));
        frame.set_state(Tagged::smi_unchecked(pc_and_state.state() as i64));
        if let Some(b) = continuation {
            frame.set_continuation(isolate.builtin_address(b));
        }
    }

    fn do_compute_arguments_adaptor_frame(
        &mut self,
        isolate: &Isolate,
        it: &mut TranslationIterator,
        frame_index: usize,
    ) {
        it.next();
        let (function, function_tagged) = self.resolve_function(isolate, it.next());
        // The height counts the receiver.
        let height = it.next_usize();
        self.check_inner_frame(isolate, frame_index, FrameType::ArgumentsAdaptor);
        if height == 0 {
            fatal_logged!(isolate.log, "arguments adaptor frame without a receiver");
        }
        let output_frame_size = height * WORD_SIZE + adaptor::FIXED_FRAME_SIZE;
        let prev = self.previous_frame(frame_index);
        let (prev_top, prev_pc, prev_fp, prev_context) =
            (prev.top(), prev.pc(), prev.fp(), prev.context());
        let top_address = prev_top - output_frame_size as u64;
        let mut frame = FrameDescription::new(output_frame_size, Some(function));
        frame.set_frame_type(FrameType::ArgumentsAdaptor);
        frame.set_top(top_address);
        frame.set_context(prev_context);
        self.install_frame(
            frame_index,
            frame,
            FrameLayout {
                frame_type: FrameType::ArgumentsAdaptor,
                top: top_address,
                frame_size: output_frame_size,
                parameter_count: height,
                function: Some(function_tagged),
            },
        );

        let mut output_offset = output_frame_size;
        for _ in 0..height {
            output_offset -= WORD_SIZE;
            self.translate_command(it, frame_index, output_offset);
        }
        let frame = self.output_frame_mut(frame_index);
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, prev_pc);
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, prev_fp);
        frame.set_fp(top_address + output_offset as u64);
        // The frame type marker takes the context's place.
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, FrameType::ArgumentsAdaptor.marker());
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, function_tagged);
        debug_assert_eq!(output_offset, 0);
        debug_assert_eq!(
            frame.slot_offset_from_fp(adaptor::FUNCTION_OFFSET),
            output_offset
        );
        frame.set_pc(stub_resume_address(isolate, Builtin::ArgumentsAdaptorTrampoline));
    }

    fn do_compute_construct_stub_frame(
        &mut self,
        isolate: &Isolate,
        it: &mut TranslationIterator,
        frame_index: usize,
    ) {
        it.next();
        let (function, function_tagged) = self.resolve_function(isolate, it.next());
        let height = it.next_usize();
        self.check_inner_frame(isolate, frame_index, FrameType::Construct);
        if height == 0 {
            fatal_logged!(isolate.log, "construct stub frame without a receiver");
        }
        let output_frame_size = height * WORD_SIZE + construct::FIXED_FRAME_SIZE;
        let prev = self.previous_frame(frame_index);
        let (prev_top, prev_pc, prev_fp, prev_context) =
            (prev.top(), prev.pc(), prev.fp(), prev.context());
        let top_address = prev_top - output_frame_size as u64;
        let mut frame = FrameDescription::new(output_frame_size, Some(function));
        frame.set_frame_type(FrameType::Construct);
        frame.set_top(top_address);
        frame.set_context(prev_context);
        self.install_frame(
            frame_index,
            frame,
            FrameLayout {
                frame_type: FrameType::Construct,
                top: top_address,
                frame_size: output_frame_size,
                parameter_count: height,
                function: Some(function_tagged),
            },
        );

        let mut output_offset = output_frame_size;
        for _ in 0..height {
            output_offset -= WORD_SIZE;
            self.translate_command(it, frame_index, output_offset);
        }
        let stub = isolate.builtin_address(Builtin::JSConstructStubGeneric);
        let frame = self.output_frame_mut(frame_index);
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, prev_pc);
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, prev_fp);
        frame.set_fp(top_address + output_offset as u64);
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, prev_context);
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, FrameType::Construct.marker());
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, stub);
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, Tagged::smi_unchecked(height as i64 - 1));
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, function_tagged);
        // The receiver the stub allocated was passed to the constructor as its receiver.
        output_offset -= WORD_SIZE;
        let receiver = frame.frame_slot(output_frame_size - WORD_SIZE);
        frame.set_frame_slot(output_offset, receiver);
        debug_assert_eq!(output_offset, 0);
        debug_assert_eq!(
            frame.slot_offset_from_fp(construct::IMPLICIT_RECEIVER_OFFSET),
            output_offset
        );
        debug_assert_eq!(
            frame.tagged_frame_slot(frame.slot_offset_from_fp(standard::MARKER_OFFSET)),
            FrameType::Construct.marker()
        );
        debug_assert_eq!(frame.frame_slot(frame.slot_offset_from_fp(construct::CODE_OFFSET)), stub);
        debug_assert_eq!(
            frame.tagged_frame_slot(frame.slot_offset_from_fp(construct::LENGTH_OFFSET)),
            Tagged::smi_unchecked(height as i64 - 1)
        );
        debug_assert_eq!(
            frame.tagged_frame_slot(frame.slot_offset_from_fp(construct::CONSTRUCTOR_OFFSET)),
            function_tagged
        );
        frame.set_pc(stub_resume_address(isolate, Builtin::JSConstructStubGeneric));

        // A receiver still waiting to be materialised must be materialised into this copy too.
        let receiver_slot = self
            .output_frame(frame_index)
            .slot_address(output_frame_size - WORD_SIZE);
        let copy = self.output_frame(frame_index).slot_address(output_offset);
        if self.deferred_numbers.iter().any(|d| d.address == receiver_slot)
            || self.deferred_duplicates.iter().any(|d| d.address == receiver_slot)
        {
            self.deferred_duplicates.push(DeferredDuplicate {
                address: copy,
                source: receiver_slot,
            });
        } else if let Some(d) = self
            .deferred_arguments
            .iter()
            .find(|d| d.address == receiver_slot)
            .copied()
        {
            self.deferred_arguments.push(DeferredArguments {
                frame_index: d.frame_index,
                address: copy,
            });
        }
    }

    fn do_compute_accessor_stub_frame(
        &mut self,
        isolate: &Isolate,
        it: &mut TranslationIterator,
        frame_index: usize,
        is_setter: bool,
    ) {
        it.next();
        let (function, function_tagged) = self.resolve_function(isolate, it.next());
        // The receiver, and a setter's value, are passed in registers: the frame has no height.
        it.next();
        let frame_type = FrameType::Internal;
        let (stub, output_frame_size) = if is_setter {
            (Builtin::StoreIcSetterForDeopt, accessor::SETTER_FRAME_SIZE)
        } else {
            (Builtin::LoadIcGetterForDeopt, accessor::GETTER_FRAME_SIZE)
        };
        self.check_inner_frame(isolate, frame_index, frame_type);
        let prev = self.previous_frame(frame_index);
        let (prev_top, prev_pc, prev_fp, prev_context) =
            (prev.top(), prev.pc(), prev.fp(), prev.context());
        let top_address = prev_top - output_frame_size as u64;
        let mut frame = FrameDescription::new(output_frame_size, Some(function));
        frame.set_frame_type(frame_type);
        frame.set_top(top_address);
        frame.set_context(prev_context);
        self.install_frame(
            frame_index,
            frame,
            FrameLayout {
                frame_type,
                top: top_address,
                frame_size: output_frame_size,
                parameter_count: 0,
                function: Some(function_tagged),
            },
        );

        let stub_code = isolate.builtin_address(stub);
        let frame = self.output_frame_mut(frame_index);
        let mut output_offset = output_frame_size;
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, prev_pc);
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, prev_fp);
        frame.set_fp(top_address + output_offset as u64);
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, prev_context);
        output_offset -= WORD_SIZE;
        frame.set_tagged_frame_slot(output_offset, FrameType::Internal.marker());
        output_offset -= WORD_SIZE;
        frame.set_frame_slot(output_offset, stub_code);
        debug_assert_eq!(
            frame.slot_offset_from_fp(accessor::CODE_OFFSET),
            output_offset
        );

        self.skip_command(it, frame_index);
        if is_setter {
            // The value being stored is the setter call's implicit return value.
            output_offset -= WORD_SIZE;
            self.translate_command(it, frame_index, output_offset);
        }
        debug_assert_eq!(output_offset, 0);
        self.output_frame_mut(frame_index)
            .set_pc(stub_resume_address(isolate, stub));
    }

    /// Read the next value command, resolving a `DUPLICATE` to the command it repeats. Returns the
    /// value and, for a duplicate, the index of the command it repeats.
    fn read_value(&self, it: &mut TranslationIterator) -> (SlotRef, Option<usize>) {
        let opcode = it.next_opcode();
        match opcode {
            Opcode::Duplicate => {
                let idx = it.next_usize();
                match self.values.get(idx) {
                    Some(v) => (*v, Some(idx)),
                    None => fatal!(
                        "duplicate of command {idx} but only {} commands precede it",
                        self.values.len()
                    ),
                }
            }
            x if x.is_value() => (
                SlotRef::read(x, it, &*self.input, self.data.literals(), &self.values),
                None,
            ),
            x => fatal!("expected a value command, found {x}"),
        }
    }

    /// Read the next value command into the slot at `output_offset` of output frame
    /// `frame_index`. Values needing an allocation are deferred.
    pub(super) fn translate_command(
        &mut self,
        it: &mut TranslationIterator,
        frame_index: usize,
        output_offset: usize,
    ) {
        let (value, source) = self.read_value(it);
        let source = source.map(|i| self.value_slots[i]);
        let marker = self.arguments_marker;
        let frame = match self.output[frame_index].as_deref_mut() {
            Some(f) => f,
            None => fatal!("output frame {frame_index} has not been built"),
        };
        let address = frame.slot_address(output_offset);
        match (value.immediate(), value) {
            (Some(t), _) => frame.set_tagged_frame_slot(output_offset, t),
            (None, SlotRef::ArgumentsObject) => {
                frame.set_tagged_frame_slot(output_offset, marker);
                self.deferred_arguments.push(DeferredArguments {
                    frame_index: source.map(|s| s.frame_index).unwrap_or(frame_index),
                    address,
                });
            }
            (None, v) => {
                frame.set_tagged_frame_slot(output_offset, marker);
                match (source.and_then(|s| s.address), v.number()) {
                    (Some(src), _) => self.deferred_duplicates.push(DeferredDuplicate {
                        address,
                        source: src,
                    }),
                    (None, Some(n)) => self.deferred_numbers.push(DeferredNumber { address, value: n }),
                    (None, None) => fatal!("{v:?} cannot be materialised"),
                }
            }
        }
        self.values.push(value);
        self.value_slots.push(ValueSlot {
            frame_index,
            address: Some(address),
        });
    }

    /// Read the next value command without writing it anywhere. It still counts as a command for
    /// later duplicates.
    fn skip_command(&mut self, it: &mut TranslationIterator, frame_index: usize) {
        let (value, _) = self.read_value(it);
        self.values.push(value);
        self.value_slots.push(ValueSlot {
            frame_index,
            address: None,
        });
    }
}

/// Where a frame built for `stub` resumes.
fn stub_resume_address(isolate: &Isolate, stub: Builtin) -> Address {
    match stub.deopt_pc_offset() {
        Some(off) => isolate.builtin_address(stub) + u64::from(off),
        None => fatal!("{stub} has no deoptimisation resume point"),
    }
}

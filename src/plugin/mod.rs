// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request/response transformation through scripting interpreters.

pub mod interpreter;
pub mod loader;
pub mod substitute;

pub use interpreter::{Direction, InstanceState, Interpreter, InterpreterInstance, InterpreterKind};
pub use loader::{InterpreterRegistry, PluginChain};

// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::PoisonError;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        IoError(::std::io::Error);
    }

    errors {
        DeviceIo(desc: String) {
            description("device i/o error")
            display("device i/o error: {}", desc)
        }

        IllegalArgument(desc: String) {
            description("illegal argument")
            display("illegal argument: {}", desc)
        }

        IllegalState(desc: String) {
            description("illegal state")
            display("illegal state: {}", desc)
        }

        AlreadyClosed(desc: String) {
            description("already closed")
            display("already closed: {}", desc)
        }

        Poisoned {
            description("poisoned lock")
            display("a thread panicked while holding a lock")
        }
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_: PoisonError<Guard>) -> Error {
        ErrorKind::Poisoned.into()
    }
}

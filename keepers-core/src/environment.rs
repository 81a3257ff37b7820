// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::interfaces::{HeadSubscriber, PerformLogProvider, Registry, ReportEncoder};

trait_set::trait_set! {
    pub trait AutoTraits = Send + Sync + 'static;
}

/// The set of collaborators a plugin instance works with.
pub trait Environment: AutoTraits {
    type Registry: Registry + AutoTraits;
    type Heads: HeadSubscriber + AutoTraits;
    type Logs: PerformLogProvider + AutoTraits;
    type Encoder: ReportEncoder + AutoTraits;

    fn registry(&self) -> &Self::Registry;
    fn heads(&self) -> &Self::Heads;
    fn logs(&self) -> &Self::Logs;
    fn encoder(&self) -> &Self::Encoder;
}

pub struct Impl<Registry, Heads, Logs, Encoder> {
    pub registry: Registry,
    pub heads: Heads,
    pub logs: Logs,
    pub encoder: Encoder,
}

impl<R, H, L, E> Environment for Impl<R, H, L, E>
where
    R: Registry + AutoTraits,
    H: HeadSubscriber + AutoTraits,
    L: PerformLogProvider + AutoTraits,
    E: ReportEncoder + AutoTraits,
{
    type Registry = R;
    type Heads = H;
    type Logs = L;
    type Encoder = E;

    fn registry(&self) -> &R {
        &self.registry
    }

    fn heads(&self) -> &H {
        &self.heads
    }

    fn logs(&self) -> &L {
        &self.logs
    }

    fn encoder(&self) -> &E {
        &self.encoder
    }
}

#[cfg(with_testing)]
pub type Test = Impl<
    crate::test_utils::FakeRegistry,
    crate::test_utils::FakeHeads,
    crate::test_utils::FakeLogProvider,
    crate::test_utils::BcsReportEncoder,
>;

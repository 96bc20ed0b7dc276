//! Terminal notifications
//!
//! Terminal nodes report every change of a rule's match set to an [`ActivationSink`]. The
//! firing loop and conflict resolution live outside this crate; [`Agenda`] is the sink the
//! session uses by default: it keeps the live activations in `(rule, tuple)` order and can
//! record every notification as an [`AgendaEvent`].

use crate::fact::FactId;
use crate::model::Declaration;
use crate::tuple::TupleId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A rule whose left-hand side matched a tuple
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub rule: String,
    pub tuple: TupleId,
    /// Fact bound to each rule declaration, in declaration order. Wrapper facts are resolved;
    /// declarations of other `Or` branches are `None`.
    pub facts: Vec<Option<FactId>>,
    pub declarations: Arc<Vec<Declaration>>,
}

impl Activation {
    pub fn new(
        rule: impl Into<String>,
        tuple: TupleId,
        facts: Vec<Option<FactId>>,
        declarations: Arc<Vec<Declaration>>,
    ) -> Self {
        Self { rule: rule.into(), tuple, facts, declarations }
    }

    /// Fact bound to the named declaration
    pub fn fact(&self, name: &str) -> Option<FactId> {
        let slot = self.declarations.iter().position(|d| d.name() == name)?;
        self.facts.get(slot).copied().flatten()
    }

    /// Facts that are bound, in declaration order
    pub fn bound_facts(&self) -> Vec<FactId> {
        self.facts.iter().flatten().copied().collect()
    }
}

/// Receives terminal notifications
pub trait ActivationSink {
    fn on_assert(&mut self, activation: Activation);

    fn on_update(&mut self, activation: Activation);

    fn on_retract(&mut self, activation: Activation);
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgendaEvent {
    Asserted(Activation),
    Updated(Activation),
    Retracted(Activation),
}

impl AgendaEvent {
    pub fn activation(&self) -> &Activation {
        match self {
            AgendaEvent::Asserted(a) | AgendaEvent::Updated(a) | AgendaEvent::Retracted(a) => a,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgendaEvent::Asserted(_) => "asserted",
            AgendaEvent::Updated(_) => "updated",
            AgendaEvent::Retracted(_) => "retracted",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Agenda {
    live: BTreeMap<(String, TupleId), Activation>,
    events: Option<Vec<AgendaEvent>>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agenda that also records every notification
    pub fn recording() -> Self {
        Self { live: BTreeMap::new(), events: Some(Vec::new()) }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn activations(&self) -> impl Iterator<Item = &Activation> {
        self.live.values()
    }

    pub fn for_rule<'a>(&'a self, rule: &'a str) -> impl Iterator<Item = &'a Activation> + 'a {
        self.live.values().filter(move |a| a.rule == rule)
    }

    pub fn contains(&self, rule: &str, tuple: TupleId) -> bool {
        self.live.contains_key(&(rule.to_string(), tuple))
    }

    /// Recorded events, empty unless recording
    pub fn events(&self) -> &[AgendaEvent] {
        self.events.as_deref().unwrap_or_default()
    }

    pub fn take_events(&mut self) -> Vec<AgendaEvent> {
        self.events.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn record(&mut self, event: AgendaEvent) {
        if let Some(events) = self.events.as_mut() {
            events.push(event);
        }
    }
}

impl ActivationSink for Agenda {
    fn on_assert(&mut self, activation: Activation) {
        self.live.insert((activation.rule.clone(), activation.tuple), activation.clone());
        self.record(AgendaEvent::Asserted(activation));
    }

    fn on_update(&mut self, activation: Activation) {
        self.live.insert((activation.rule.clone(), activation.tuple), activation.clone());
        self.record(AgendaEvent::Updated(activation));
    }

    fn on_retract(&mut self, activation: Activation) {
        self.live.remove(&(activation.rule.clone(), activation.tuple));
        self.record(AgendaEvent::Retracted(activation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reticle_types::FactType;

    fn activation(rule: &str, tuple: u64) -> Activation {
        let declarations = Arc::new(vec![
            Declaration::new("a", FactType::new("Account")),
            Declaration::new("h", FactType::new("Hold")),
        ]);
        Activation::new(rule, TupleId(tuple), vec![Some(FactId(tuple)), None], declarations)
    }

    #[test]
    fn test_live_set_follows_notifications() {
        let mut agenda = Agenda::recording();
        agenda.on_assert(activation("overdraft", 3));
        agenda.on_assert(activation("audit", 4));
        agenda.on_update(activation("overdraft", 3));
        assert_eq!(agenda.len(), 2);
        assert!(agenda.contains("overdraft", TupleId(3)));
        assert_eq!(agenda.for_rule("audit").count(), 1);

        agenda.on_retract(activation("overdraft", 3));
        assert_eq!(agenda.len(), 1);

        let kinds: Vec<_> = agenda.events().iter().map(AgendaEvent::kind).collect();
        assert_eq!(kinds, vec!["asserted", "asserted", "updated", "retracted"]);
        assert_eq!(agenda.take_events().len(), 4);
        assert!(agenda.events().is_empty());
    }

    #[test]
    fn test_activation_binds_by_name() {
        let activation = activation("overdraft", 7);
        assert_eq!(activation.fact("a"), Some(FactId(7)));
        assert_eq!(activation.fact("h"), None);
        assert_eq!(activation.fact("x"), None);
        assert_eq!(activation.bound_facts(), vec![FactId(7)]);
    }

    #[test]
    fn test_plain_agenda_does_not_record() {
        let mut agenda = Agenda::new();
        agenda.on_assert(activation("overdraft", 1));
        assert!(agenda.events().is_empty());
        assert_eq!(agenda.activations().count(), 1);
    }
}

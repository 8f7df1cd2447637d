use crate::{
    fixture::{Fixture, RequestDescriptor},
    normalize,
    store::{FixtureStore, ScenarioManager},
};

/// Outcome of [`select_fixture`], borrowing from the supplied fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    Scenario(&'a Fixture),
    Default(&'a Fixture),
    NoMatch,
}

/// Owned outcome of [`Resolver::resolve`]; carries the store the fixture came from so the
/// responder can read its assets.
#[derive(Debug, Clone)]
pub enum Resolution {
    Scenario { fixture: Fixture, store: FixtureStore },
    Default { fixture: Fixture, store: FixtureStore },
    NoMatch,
}

impl Resolution {
    pub fn source(&self) -> &'static str {
        match self {
            Self::Scenario { .. } => "scenario",
            Self::Default { .. } => "default",
            Self::NoMatch => "none",
        }
    }

    pub fn fixture_id(&self) -> Option<&str> {
        match self {
            Self::Scenario { fixture, .. } | Self::Default { fixture, .. } => Some(&fixture.id),
            Self::NoMatch => None,
        }
    }
}

/// Picks the fixture that answers `request`.
///
/// Scenario fixtures are scanned in index order with a running gate: a fixture flagged
/// `waitForPrevious` is only eligible once the fixture scanned just before it has been served.
/// Among eligible matches the earliest unserved one wins, else the last one. Without a scenario
/// match the first matching default fixture is used, ignoring served state.
pub fn select_fixture<'a>(
    scenario_fixtures: &'a [Fixture],
    default_fixtures: &'a [Fixture],
    request: &RequestDescriptor,
) -> Selection<'a> {
    let mut gate = false;
    let mut first_unserved = None;
    let mut last_candidate = None;
    for fixture in scenario_fixtures {
        if fixture.wait_for_previous && !gate {
            continue;
        }
        gate = fixture.served;
        if !normalize::requests_equal(fixture, request, &fixture.ignore_params) {
            continue;
        }
        if !fixture.served && first_unserved.is_none() {
            first_unserved = Some(fixture);
        }
        last_candidate = Some(fixture);
    }
    if let Some(fixture) = first_unserved.or(last_candidate) {
        return Selection::Scenario(fixture);
    }

    default_fixtures
        .iter()
        .find(|fixture| normalize::requests_equal(*fixture, request, &fixture.ignore_params))
        .map_or(Selection::NoMatch, Selection::Default)
}

#[derive(Debug, Clone)]
pub struct Resolver {
    manager: ScenarioManager,
}

impl Resolver {
    pub fn new(manager: ScenarioManager) -> Self {
        Self { manager }
    }

    /// Resolves `request` against fresh reads of the scenario and default stores.
    ///
    /// A scenario fixture is marked served before this returns.
    pub async fn resolve(&self, scenario: Option<&str>, request: &RequestDescriptor) -> Resolution {
        let scenario_store = match scenario.map(|name| self.manager.scenario_store(name)) {
            Some(Ok(store)) => Some(store),
            Some(Err(err)) => {
                tracing::warn!(scenario = scenario.unwrap_or_default(), "ignoring active scenario: {err}");
                None
            }
            None => None,
        };
        let scenario_fixtures = match &scenario_store {
            Some(store) => load_or_empty(store).await,
            None => Vec::new(),
        };
        let default_store = self.manager.default_store();
        let default_fixtures = load_or_empty(&default_store).await;

        match select_fixture(&scenario_fixtures, &default_fixtures, request) {
            Selection::Scenario(fixture) => {
                let Some(store) = scenario_store else {
                    return Resolution::NoMatch;
                };
                if let Err(err) = store.mark_served(&fixture.id, true).await {
                    tracing::warn!(
                        scenario = %store.label(),
                        fixture_id = %fixture.id,
                        "failed to mark fixture served: {err}"
                    );
                }
                let mut fixture = fixture.clone();
                fixture.served = true;
                Resolution::Scenario { fixture, store }
            }
            Selection::Default(fixture) => Resolution::Default {
                fixture: fixture.clone(),
                store: default_store,
            },
            Selection::NoMatch => Resolution::NoMatch,
        }
    }
}

async fn load_or_empty(store: &FixtureStore) -> Vec<Fixture> {
    match store.load_all().await {
        Ok(fixtures) => fixtures,
        Err(err) => {
            tracing::warn!(store = %store.label(), "treating unreadable fixture store as empty: {err}");
            Vec::new()
        }
    }
}

use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use time::{Duration, OffsetDateTime};

pub const MISSING_IDENTIFIER_MESSAGE: &str =
    "At least one of email or phoneNumber must be provided";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// Position of a contact inside its identity group.
///
/// A secondary always names the primary it reports to, so a secondary without a
/// `linked_id` cannot be represented.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Link {
    Primary,
    Secondary { linked_id: ContactId },
}

impl Link {
    #[must_use]
    pub fn precedence(self) -> LinkPrecedence {
        match self {
            Self::Primary => LinkPrecedence::Primary,
            Self::Secondary { .. } => LinkPrecedence::Secondary,
        }
    }

    #[must_use]
    pub fn linked_id(self) -> Option<ContactId> {
        match self {
            Self::Primary => None,
            Self::Secondary { linked_id } => Some(linked_id),
        }
    }

    #[must_use]
    pub fn is_primary(self) -> bool {
        matches!(self, Self::Primary)
    }

    /// Rebuild a link from its stored precedence column and `linked_id` column.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the pair is inconsistent.
    pub fn from_parts(
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> Result<Self, IdentityError> {
        match (precedence, linked_id) {
            (LinkPrecedence::Primary, None) => Ok(Self::Primary),
            (LinkPrecedence::Secondary, Some(linked_id)) => Ok(Self::Secondary { linked_id }),
            (LinkPrecedence::Primary, Some(linked_id)) => Err(IdentityError::Store(format!(
                "primary contact unexpectedly linked to {linked_id}"
            ))),
            (LinkPrecedence::Secondary, None) => {
                Err(IdentityError::Store("secondary contact is missing linked_id".to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link: Link,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Contact {
    fn seniority(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }
}

/// Fields supplied when a store creates a contact; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link: Link,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactPredicate {
    EmailEq(String),
    PhoneEq(String),
    EmailIn(Vec<String>),
    PhoneIn(Vec<String>),
    IdIn(Vec<ContactId>),
    LinkedIdIn(Vec<ContactId>),
}

impl ContactPredicate {
    #[must_use]
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            Self::EmailEq(email) => contact.email.as_deref() == Some(email.as_str()),
            Self::PhoneEq(phone) => contact.phone_number.as_deref() == Some(phone.as_str()),
            Self::EmailIn(emails) => contact.email.as_ref().is_some_and(|e| emails.contains(e)),
            Self::PhoneIn(phones) => {
                contact.phone_number.as_ref().is_some_and(|p| phones.contains(p))
            }
            Self::IdIn(ids) => ids.contains(&contact.id),
            Self::LinkedIdIn(ids) => contact.link.linked_id().is_some_and(|id| ids.contains(&id)),
        }
    }
}

/// OR of predicates. An empty filter matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactFilter {
    pub any_of: Vec<ContactPredicate>,
}

impl ContactFilter {
    #[must_use]
    pub fn any_of(any_of: Vec<ContactPredicate>) -> Self {
        Self { any_of }
    }

    #[must_use]
    pub fn matches(&self, contact: &Contact) -> bool {
        self.any_of.iter().any(|predicate| predicate.matches(contact))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ContactOrder {
    Id,
    /// Ascending `created_at`; equal timestamps fall back to ascending id.
    CreatedAt,
}

impl ContactOrder {
    pub fn sort(self, contacts: &mut [Contact]) {
        match self {
            Self::Id => contacts.sort_by_key(|contact| contact.id),
            Self::CreatedAt => contacts.sort_by_key(Contact::seniority),
        }
    }
}

/// Durable keyed contact storage used by the resolver.
///
/// Each call is an independent operation; the resolver never asks for a
/// transaction spanning several calls.
pub trait ContactStore {
    /// # Errors
    /// Returns [`IdentityError::Store`] when the backing store cannot be queried.
    fn find_many(
        &self,
        filter: &ContactFilter,
        order: ContactOrder,
    ) -> Result<Vec<Contact>, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::Store`] when the contact cannot be persisted.
    fn create(&mut self, contact: NewContact) -> Result<Contact, IdentityError>;

    /// Rewrite the precedence and link of an existing contact.
    ///
    /// # Errors
    /// Returns [`IdentityError::Store`] when the contact does not exist or the write fails.
    fn relink(&mut self, id: ContactId, link: Link) -> Result<Contact, IdentityError>;
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    System,
    Stepped { next: OffsetDateTime, step: Duration },
}

impl Clock {
    fn tick(&mut self) -> OffsetDateTime {
        match self {
            Self::System => OffsetDateTime::now_utc(),
            Self::Stepped { next, step } => {
                let now = *next;
                *next = now + *step;
                now
            }
        }
    }
}

/// `Vec`-backed store with sequential ids starting at 1.
#[derive(Debug, Clone)]
pub struct MemoryContactStore {
    contacts: Vec<Contact>,
    next_id: i64,
    clock: Clock,
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self { contacts: Vec::new(), next_id: 1, clock: Clock::System }
    }

    /// Use a deterministic clock that starts at `start` and advances by `step` per write.
    #[must_use]
    pub fn with_stepped_clock(mut self, start: OffsetDateTime, step: Duration) -> Self {
        self.clock = Clock::Stepped { next: start, step };
        self
    }

    /// Seed the store with existing rows, for example ones loaded from elsewhere.
    /// Later writes are stamped one second after the newest seeded row.
    #[must_use]
    pub fn from_contacts(contacts: Vec<Contact>) -> Self {
        let next_id = contacts.iter().map(|contact| contact.id.0).max().unwrap_or(0) + 1;
        let start = contacts
            .iter()
            .map(|contact| contact.created_at.max(contact.updated_at))
            .max()
            .map_or_else(OffsetDateTime::now_utc, |latest| latest + Duration::seconds(1));
        Self { contacts, next_id, clock: Clock::Stepped { next: start, step: Duration::seconds(1) } }
    }

    #[must_use]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }
}

impl ContactStore for MemoryContactStore {
    fn find_many(
        &self,
        filter: &ContactFilter,
        order: ContactOrder,
    ) -> Result<Vec<Contact>, IdentityError> {
        let mut found = self
            .contacts
            .iter()
            .filter(|contact| filter.matches(contact))
            .cloned()
            .collect::<Vec<_>>();
        order.sort(&mut found);
        Ok(found)
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, IdentityError> {
        let now = self.clock.tick();
        let created = Contact {
            id: ContactId(self.next_id),
            email: contact.email,
            phone_number: contact.phone_number,
            link: contact.link,
            created_at: now,
            updated_at: now,
        };
        self.next_id += 1;
        self.contacts.push(created.clone());
        Ok(created)
    }

    fn relink(&mut self, id: ContactId, link: Link) -> Result<Contact, IdentityError> {
        let now = self.clock.tick();
        let Some(contact) = self.contacts.iter_mut().find(|contact| contact.id == id) else {
            return Err(IdentityError::Store(format!("contact {id} does not exist")));
        };
        contact.link = link;
        contact.updated_at = now;
        Ok(contact.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldValue {
    Text(String),
    Integer(i64),
}

// Clients commonly send phone numbers as bare JSON numbers.
fn lenient_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<FieldValue>::deserialize(deserializer)?;
    Ok(value.map(|value| match value {
        FieldValue::Text(text) => text,
        FieldValue::Integer(number) => number.to_string(),
    }))
}

/// Body of an identify call, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default, deserialize_with = "lenient_field")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_field")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Trim both fields and drop the empty ones.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither field survives trimming.
    pub fn normalize(&self) -> Result<Fragment, IdentityError> {
        Fragment::new(self.email.as_deref(), self.phone_number.as_deref())
    }
}

/// A validated identity fragment: at least one of the two fields is present and non-blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Fragment {
    /// # Errors
    /// Returns [`IdentityError::Validation`] when both fields are absent or blank.
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, IdentityError> {
        let email = normalize_field(email);
        let phone_number = normalize_field(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::Validation(MISSING_IDENTIFIER_MESSAGE.to_string()));
        }
        Ok(Self { email, phone_number })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

fn normalize_field(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(str::to_string)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactView {
    // Historical spelling kept for wire compatibility.
    #[serde(rename = "primaryContatctId")]
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: ContactView,
}

/// Validate a raw request and reconcile it against `store`.
///
/// # Errors
/// Returns [`IdentityError::Validation`] before touching the store when the request
/// carries no usable field, and [`IdentityError::Store`] when any store call fails.
pub fn identify<S>(store: &mut S, request: &IdentifyRequest) -> Result<IdentifyResponse, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let fragment = request.normalize()?;
    resolve(store, &fragment)
}

/// Reconcile one fragment: expand its identity group, elect and enforce a single
/// primary, record any new field, and return the merged view.
///
/// Store calls are issued one by one with no surrounding transaction. Two requests
/// racing on the same unseen fragment may both create a primary; the next request
/// touching either of them merges the pair.
///
/// # Errors
/// Returns [`IdentityError::Store`] when any store call fails. Writes made before the
/// failure are not rolled back.
pub fn resolve<S>(store: &mut S, fragment: &Fragment) -> Result<IdentifyResponse, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let initial = find_initial_matches(store, fragment)?;

    if initial.is_empty() {
        let created = store.create(NewContact {
            email: fragment.email.clone(),
            phone_number: fragment.phone_number.clone(),
            link: Link::Primary,
        })?;
        tracing::info!(contact_id = %created.id, "created primary contact for unseen fragment");
        let contact = project_view(&created, std::slice::from_ref(&created));
        return Ok(IdentifyResponse { contact });
    }

    let component_ids = expand_component(store, &initial)?;
    let mut component = store.find_many(
        &ContactFilter::any_of(vec![ContactPredicate::IdIn(component_ids.into_iter().collect())]),
        ContactOrder::CreatedAt,
    )?;

    let Some(primary_id) = elect_primary(&component).map(|primary| primary.id) else {
        return Err(IdentityError::Store(
            "matched contacts disappeared during resolution".to_string(),
        ));
    };

    relink_component(store, &mut component, primary_id)?;

    if let Some(created) = insert_fragment(store, fragment, &component, primary_id)? {
        component.push(created);
    }

    let Some(primary) = component.iter().find(|contact| contact.id == primary_id) else {
        return Err(IdentityError::Store(format!("elected primary {primary_id} went missing")));
    };
    let contact = project_view(primary, &component);
    Ok(IdentifyResponse { contact })
}

/// Contacts whose email or phone exactly equals a field present in the fragment,
/// oldest first.
///
/// # Errors
/// Returns [`IdentityError::Store`] when the lookup fails.
pub fn find_initial_matches<S>(store: &S, fragment: &Fragment) -> Result<Vec<Contact>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut predicates = Vec::with_capacity(4);
    if let Some(email) = &fragment.email {
        predicates.push(ContactPredicate::EmailEq(email.clone()));
    }
    if let Some(phone_number) = &fragment.phone_number {
        predicates.push(ContactPredicate::PhoneEq(phone_number.clone()));
    }
    store.find_many(&ContactFilter::any_of(predicates), ContactOrder::CreatedAt)
}

/// Breadth-first closure over shared emails and phone numbers, starting at `seeds`.
///
/// Every round queries the store for contacts sharing a value with the previous
/// round's discoveries; the walk stops once a round finds nothing new. Link edges
/// are followed too, in both directions: a secondary holding only a field its group
/// did not know yet shares no value with the rest of the group.
///
/// # Errors
/// Returns [`IdentityError::Store`] when a round's lookup fails.
pub fn expand_component<S>(store: &S, seeds: &[Contact]) -> Result<BTreeSet<ContactId>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut discovered = seeds.iter().map(|contact| contact.id).collect::<BTreeSet<_>>();
    let mut frontier = seeds.to_vec();
    let mut round = 0_usize;

    while !frontier.is_empty() {
        round += 1;
        let emails = distinct_values(frontier.iter().filter_map(|c| c.email.as_deref()));
        let phone_numbers = distinct_values(frontier.iter().filter_map(|c| c.phone_number.as_deref()));

        let mut predicates = Vec::with_capacity(4);
        if !emails.is_empty() {
            predicates.push(ContactPredicate::EmailIn(emails));
        }
        if !phone_numbers.is_empty() {
            predicates.push(ContactPredicate::PhoneIn(phone_numbers));
        }
        let linked_ids = frontier
            .iter()
            .filter_map(|contact| contact.link.linked_id())
            .filter(|linked_id| !discovered.contains(linked_id))
            .collect::<BTreeSet<_>>();
        if !linked_ids.is_empty() {
            predicates.push(ContactPredicate::IdIn(linked_ids.into_iter().collect()));
        }
        predicates.push(ContactPredicate::LinkedIdIn(
            frontier.iter().map(|contact| contact.id).collect(),
        ));

        let reached = store.find_many(&ContactFilter::any_of(predicates), ContactOrder::Id)?;
        frontier = reached.into_iter().filter(|contact| discovered.insert(contact.id)).collect();
        tracing::debug!(
            round,
            discovered = discovered.len(),
            new_contacts = frontier.len(),
            "expanded identity component"
        );
    }

    Ok(discovered)
}

fn distinct_values<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values.collect::<BTreeSet<_>>().into_iter().map(str::to_string).collect()
}

/// Pick the canonical primary of a component.
///
/// The oldest contact flagged primary wins, lowest id breaking timestamp ties. A
/// component with no primary at all indicates damaged data; the oldest contact
/// overall is chosen instead and a warning is logged.
#[must_use]
pub fn elect_primary(component: &[Contact]) -> Option<&Contact> {
    let elected = component
        .iter()
        .filter(|contact| contact.link.is_primary())
        .min_by_key(|contact| contact.seniority());
    if elected.is_some() {
        return elected;
    }

    let fallback = component.iter().min_by_key(|contact| contact.seniority());
    if let Some(contact) = fallback {
        tracing::warn!(
            contact_id = %contact.id,
            component_size = component.len(),
            "identity component has no primary contact; electing earliest-created contact"
        );
    }
    fallback
}

/// Make `primary_id` the only primary of the component and point every other
/// contact straight at it. Contacts already in the right shape are not written.
///
/// Competing primaries are demoted first, then stale secondaries are repaired.
/// `component` is updated in place with the rows returned by the store. Returns
/// the number of writes issued.
///
/// # Errors
/// Returns [`IdentityError::Store`] when a write fails; earlier writes stay applied.
pub fn relink_component<S>(
    store: &mut S,
    component: &mut [Contact],
    primary_id: ContactId,
) -> Result<usize, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut order = (0..component.len()).collect::<Vec<_>>();
    order.sort_by_key(|&index| !component[index].link.is_primary());

    let mut writes = 0;
    for index in order {
        let Contact { id, link, .. } = component[index];
        let target = if id == primary_id {
            Link::Primary
        } else {
            Link::Secondary { linked_id: primary_id }
        };
        if link == target {
            continue;
        }

        match (link, target) {
            (Link::Primary, Link::Secondary { .. }) => tracing::info!(
                contact_id = %id,
                primary_id = %primary_id,
                "demoting younger primary into merged identity group"
            ),
            (Link::Secondary { .. }, Link::Primary) => tracing::warn!(
                contact_id = %id,
                "promoting secondary contact to primary of its identity group"
            ),
            _ => tracing::debug!(
                contact_id = %id,
                primary_id = %primary_id,
                "repointing secondary contact at group primary"
            ),
        }

        component[index] = store.relink(id, target)?;
        writes += 1;
    }

    Ok(writes)
}

/// Create a secondary for whatever part of the fragment the group does not know yet.
///
/// Only the unknown field(s) are stored on the new row. Returns `None` when the
/// fragment adds nothing.
///
/// # Errors
/// Returns [`IdentityError::Store`] when the insert fails.
pub fn insert_fragment<S>(
    store: &mut S,
    fragment: &Fragment,
    component: &[Contact],
    primary_id: ContactId,
) -> Result<Option<Contact>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let known_emails =
        component.iter().filter_map(|contact| contact.email.as_deref()).collect::<HashSet<_>>();
    let known_phone_numbers = component
        .iter()
        .filter_map(|contact| contact.phone_number.as_deref())
        .collect::<HashSet<_>>();

    let new_email = fragment.email.clone().filter(|email| !known_emails.contains(email.as_str()));
    let new_phone_number = fragment
        .phone_number
        .clone()
        .filter(|phone_number| !known_phone_numbers.contains(phone_number.as_str()));

    if new_email.is_none() && new_phone_number.is_none() {
        return Ok(None);
    }

    let created = store.create(NewContact {
        email: new_email,
        phone_number: new_phone_number,
        link: Link::Secondary { linked_id: primary_id },
    })?;
    tracing::info!(
        contact_id = %created.id,
        primary_id = %primary_id,
        "recorded new identity fragment as secondary contact"
    );
    Ok(Some(created))
}

/// Build the merged view of a group. The primary's own fields come first, the rest
/// follow in `component` order, each value once.
#[must_use]
pub fn project_view(primary: &Contact, component: &[Contact]) -> ContactView {
    let others = component.iter().filter(|contact| contact.id != primary.id);

    let mut seen_emails = HashSet::new();
    let mut seen_phone_numbers = HashSet::new();
    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    for contact in std::iter::once(primary).chain(others.clone()) {
        if let Some(email) = contact.email.as_deref() {
            if seen_emails.insert(email) {
                emails.push(email.to_string());
            }
        }
        if let Some(phone_number) = contact.phone_number.as_deref() {
            if seen_phone_numbers.insert(phone_number) {
                phone_numbers.push(phone_number.to_string());
            }
        }
    }

    ContactView {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: others.map(|contact| contact.id).collect(),
    }
}
